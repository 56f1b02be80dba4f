//! File-level container codec: sequential writer and random-access reader.
//!
//! A container file is laid out as
//!
//! ```text
//! Header (fixed 96 bytes, index pointer zeroed)
//! Layout record   (compressed JSON, never encrypted)
//! Block records   (data and delta payloads, compressed, optionally encrypted)
//! Index record    (compressed JSON, never encrypted)
//! ```
//!
//! The writer patches the header's index pointer in place only after the
//! index record has been written in full, so a crash mid-write leaves a file
//! the reader rejects with `MissingIndex` instead of serving partial data.
//! Layout and index records stay unencrypted so a set can be enumerated and
//! chains validated without a password; block payloads carry the
//! confidentiality.

use crate::block::{self, BlockError, BlockKind, MetadataBlockHeader, BLOCK_HEADER_SIZE};
use crate::crypto::{CryptoError, CryptoSession};
use crate::header::{
    FormatCaps, FormatError, Header, FLAG_DELTA_INDEX, FLAG_ENCRYPTED, HEADER_SIZE,
};
use crate::index::{BlockIndex, DeltaPayload, IndexEntry};
use crate::layout::FileLayout;
use crate::types::{CompressionLevel, EncryptionStrength};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("malformed {record} record: {source}")]
    MalformedRecord {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected {found:?} record where {expected:?} was required")]
    UnexpectedRecord { expected: BlockKind, found: BlockKind },
    #[error("container is encrypted and no password was supplied")]
    PasswordRequired,
    #[error("writer was already finalized")]
    AlreadyFinalized,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn malformed(record: &'static str) -> impl FnOnce(serde_json::Error) -> CodecError {
    move |source| CodecError::MalformedRecord { record, source }
}

/// A block record as stored, before delta resolution.
#[derive(Debug)]
pub enum DecodedBlock {
    Full(Vec<u8>),
    Delta(DeltaPayload),
}

/// Sequential writer for one container file.
///
/// Records are appended in order; `finalize` writes the trailing index and
/// patches the header. Dropping an unfinalized writer leaves a file with a
/// zero index pointer.
pub struct ImageWriter<W: Write + Seek> {
    writer: W,
    header: Header,
    level: CompressionLevel,
    session: Option<CryptoSession>,
    entries: Vec<IndexEntry>,
    finalized: bool,
}

impl<W: Write + Seek> ImageWriter<W> {
    /// Write the header (index pointer zeroed) and the layout record, leaving
    /// the writer positioned for block records. The layout must already carry
    /// the session's nonce and key check when `session` is given.
    pub fn create(
        mut writer: W,
        mut header: Header,
        layout: &FileLayout,
        session: Option<CryptoSession>,
    ) -> Result<Self, CodecError> {
        if session.is_some() {
            header.flags |= FLAG_ENCRYPTED;
        }
        header.index_offset = 0;
        header.index_len = 0;
        writer.seek(SeekFrom::Start(0))?;
        header.write(&mut writer)?;

        let level = layout.compression.level;
        let layout_json = serde_json::to_vec(layout).map_err(malformed("layout"))?;
        let (block_header, payload) =
            block::encode_block(BlockKind::Layout, 0, &layout_json, level, None)?;
        block_header.write(&mut writer)?;
        writer.write_all(&payload)?;

        Ok(Self { writer, header, level, session, entries: Vec::new(), finalized: false })
    }

    pub fn definition_id(&self) -> uuid::Uuid {
        self.header.definition_id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Append one full data block.
    pub fn write_data_block(&mut self, block_index: u32, data: &[u8]) -> Result<(), CodecError> {
        if self.finalized {
            return Err(CodecError::AlreadyFinalized);
        }
        let file_offset = self.writer.stream_position()?;
        let (header, payload) = block::encode_block(
            BlockKind::Data,
            block_index,
            data,
            self.level,
            self.session.as_ref(),
        )?;
        header.write(&mut self.writer)?;
        self.writer.write_all(&payload)?;
        self.entries.push(IndexEntry::Data {
            block_index,
            file_offset,
            stored_len: header.stored_len,
            orig_len: header.orig_len,
            content_hash: header.content_hash,
        });
        Ok(())
    }

    /// Append one delta block. `resolved` is the full post-delta content;
    /// its hash goes into the index entry so verification never needs to
    /// re-resolve the chain to know what this block should contain.
    pub fn write_delta_block(
        &mut self,
        block_index: u32,
        delta: &DeltaPayload,
        resolved: &[u8],
    ) -> Result<(), CodecError> {
        if self.finalized {
            return Err(CodecError::AlreadyFinalized);
        }
        let file_offset = self.writer.stream_position()?;
        let encoded = delta.to_bytes();
        let (header, payload) = block::encode_block(
            BlockKind::Delta,
            block_index,
            &encoded,
            self.level,
            self.session.as_ref(),
        )?;
        header.write(&mut self.writer)?;
        self.writer.write_all(&payload)?;
        self.entries.push(IndexEntry::Delta {
            block_index,
            file_offset,
            stored_len: header.stored_len,
            orig_len: resolved.len() as u32,
            content_hash: *blake3::hash(resolved).as_bytes(),
            base: delta.base,
        });
        Ok(())
    }

    /// Encode and append a batch of full blocks. With the `parallel` feature
    /// the encode stage fans out over rayon; writes stay sequential either
    /// way, so record order matches input order.
    pub fn write_data_blocks(&mut self, blocks: &[(u32, Vec<u8>)]) -> Result<(), CodecError> {
        if self.finalized {
            return Err(CodecError::AlreadyFinalized);
        }
        let encoded = self.encode_batch(blocks)?;
        for (header, payload) in encoded {
            let file_offset = self.writer.stream_position()?;
            header.write(&mut self.writer)?;
            self.writer.write_all(&payload)?;
            self.entries.push(IndexEntry::Data {
                block_index: header.block_index,
                file_offset,
                stored_len: header.stored_len,
                orig_len: header.orig_len,
                content_hash: header.content_hash,
            });
        }
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn encode_batch(
        &self,
        blocks: &[(u32, Vec<u8>)],
    ) -> Result<Vec<(MetadataBlockHeader, Vec<u8>)>, CodecError> {
        use rayon::prelude::*;
        blocks
            .par_iter()
            .map(|(index, data)| {
                block::encode_block(
                    BlockKind::Data,
                    *index,
                    data,
                    self.level,
                    self.session.as_ref(),
                )
                .map_err(CodecError::from)
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn encode_batch(
        &self,
        blocks: &[(u32, Vec<u8>)],
    ) -> Result<Vec<(MetadataBlockHeader, Vec<u8>)>, CodecError> {
        blocks
            .iter()
            .map(|(index, data)| {
                block::encode_block(
                    BlockKind::Data,
                    *index,
                    data,
                    self.level,
                    self.session.as_ref(),
                )
                .map_err(CodecError::from)
            })
            .collect()
    }

    /// Write the trailing index record, then patch the header's index pointer
    /// and flags. Returns the completed header.
    pub fn finalize(mut self) -> Result<Header, CodecError> {
        if self.finalized {
            return Err(CodecError::AlreadyFinalized);
        }
        self.finalized = true;

        let mut index = BlockIndex { entries: std::mem::take(&mut self.entries), root_hash: [0; 32] };
        index.compute_root_hash();
        if index.entries.iter().any(IndexEntry::is_delta) {
            self.header.flags |= FLAG_DELTA_INDEX;
        }

        let index_json = index.to_bytes().map_err(malformed("index"))?;
        let index_offset = self.writer.stream_position()?;
        let (block_header, payload) =
            block::encode_block(BlockKind::Index, 0, &index_json, self.level, None)?;
        block_header.write(&mut self.writer)?;
        self.writer.write_all(&payload)?;

        self.header.index_offset = index_offset;
        self.header.index_len = (BLOCK_HEADER_SIZE + payload.len()) as u64;
        self.writer.seek(SeekFrom::Start(0))?;
        self.header.write(&mut self.writer)?;
        self.writer.flush()?;

        debug!(
            definition = %self.header.definition_id,
            blocks = index.entries.len(),
            index_offset,
            "finalized container"
        );
        Ok(self.header)
    }
}

/// Random-access reader for one container file.
pub struct ImageReader<R: Read + Seek> {
    reader: R,
    header: Header,
    layout: FileLayout,
    index: BlockIndex,
    session: Option<CryptoSession>,
}

impl<R: Read + Seek> ImageReader<R> {
    /// Validate the header, load the layout and index records, and open a
    /// crypto session if the file is encrypted. A wrong password is caught
    /// here against the stored key check, before any block is touched.
    pub fn open(
        reader: R,
        caps: FormatCaps,
        password: Option<&str>,
    ) -> Result<Self, CodecError> {
        let mut this = Self::open_metadata(reader, caps)?;
        if this.header.is_encrypted() {
            let password = password.ok_or(CodecError::PasswordRequired)?;
            let enc = &this.layout.encryption;
            let derivation = enc
                .key_derivation
                .as_ref()
                .ok_or(CodecError::Crypto(CryptoError::NoCipher))?;
            let session =
                CryptoSession::open(enc.strength, password, derivation, &enc.session_nonce)?;
            session.verify_key_check(&enc.key_check)?;
            this.session = Some(session);
        }
        Ok(this)
    }

    /// Open for metadata only: header, layout and index, no crypto session.
    /// Works on encrypted containers because those records are never
    /// encrypted; reading an encrypted block afterwards fails with
    /// `MissingKey`.
    pub fn open_metadata(mut reader: R, caps: FormatCaps) -> Result<Self, CodecError> {
        reader.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut reader, caps)?;
        if header.index_offset == 0 {
            return Err(CodecError::Format(FormatError::MissingIndex));
        }

        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let layout_json = read_record(&mut reader, BlockKind::Layout)?;
        let layout: FileLayout =
            serde_json::from_slice(&layout_json).map_err(malformed("layout"))?;

        reader.seek(SeekFrom::Start(header.index_offset))?;
        let index_json = read_record(&mut reader, BlockKind::Index)?;
        let index = BlockIndex::from_bytes(&index_json).map_err(malformed("index"))?;

        Ok(Self { reader, header, layout, index, session: None })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn definition_id(&self) -> uuid::Uuid {
        self.header.definition_id
    }

    /// Fetch one block record as stored. Data entries come back as the full
    /// decoded content; delta entries come back as the parsed delta payload
    /// for the caller to resolve.
    pub fn read_block(&mut self, block_index: u32) -> Result<Option<DecodedBlock>, CodecError> {
        let Some(entry) = self.index.get(block_index) else {
            return Ok(None);
        };
        let offset = entry.file_offset();
        let is_delta = entry.is_delta();
        let entry_base = entry.base();
        self.reader.seek(SeekFrom::Start(offset))?;
        let record_header = MetadataBlockHeader::read(&mut self.reader)?;
        let expected = if is_delta { BlockKind::Delta } else { BlockKind::Data };
        if record_header.kind != expected {
            return Err(CodecError::UnexpectedRecord { expected, found: record_header.kind });
        }
        let mut payload = vec![0u8; record_header.stored_len as usize];
        self.reader.read_exact(&mut payload)?;
        let data = block::decode_block(&record_header, &payload, self.session.as_ref())?;

        if is_delta {
            let mut delta = DeltaPayload::from_bytes(&data)?;
            // The index entry's base key is authoritative: consolidation
            // re-points references by rewriting the index, never the records.
            if let Some(base) = entry_base {
                delta.base = base;
            }
            Ok(Some(DecodedBlock::Delta(delta)))
        } else {
            Ok(Some(DecodedBlock::Full(data)))
        }
    }
}

fn read_record<R: Read>(mut reader: R, expected: BlockKind) -> Result<Vec<u8>, CodecError> {
    let header = MetadataBlockHeader::read(&mut reader)?;
    if header.kind != expected {
        return Err(CodecError::UnexpectedRecord { expected, found: header.kind });
    }
    let mut payload = vec![0u8; header.stored_len as usize];
    reader.read_exact(&mut payload)?;
    Ok(block::decode_block(&header, &payload, None)?)
}

/// Append a replacement index record and re-point the header at it.
///
/// Used by consolidation to rewrite delta back-references after a merge. The
/// old index record stays in the file as dead bytes; the header pointer flip
/// is the commit point, same as on first finalize.
pub fn rewrite_index<F: Read + Write + Seek>(
    file: &mut F,
    caps: FormatCaps,
    index: &BlockIndex,
) -> Result<(), CodecError> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = Header::read(&mut *file, caps)?;

    let index_json = index.to_bytes().map_err(malformed("index"))?;
    let index_offset = file.seek(SeekFrom::End(0))?;
    let (block_header, payload) =
        block::encode_block(BlockKind::Index, 0, &index_json, CompressionLevel::Medium, None)?;
    block_header.write(&mut *file)?;
    file.write_all(&payload)?;

    header.index_offset = index_offset;
    header.index_len = (BLOCK_HEADER_SIZE + payload.len()) as u64;
    if index.entries.iter().any(IndexEntry::is_delta) {
        header.flags |= FLAG_DELTA_INDEX;
    } else {
        header.flags &= !FLAG_DELTA_INDEX;
    }
    file.seek(SeekFrom::Start(0))?;
    header.write(&mut *file)?;
    file.flush()?;
    Ok(())
}

/// Patch a container's parent link after its parent was absorbed by a
/// merge. Only the fixed header is rewritten.
pub fn rewrite_parent<F: Read + Write + Seek>(
    file: &mut F,
    caps: FormatCaps,
    new_parent: Option<uuid::Uuid>,
) -> Result<(), CodecError> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = Header::read(&mut *file, caps)?;
    header.parent_id = new_parent.unwrap_or_else(uuid::Uuid::nil);
    file.seek(SeekFrom::Start(0))?;
    header.write(&mut *file)?;
    file.flush()?;
    Ok(())
}

/// Build the encryption parameters a layout must carry for `session`.
pub fn encryption_params_for(
    session: &CryptoSession,
    derivation: crate::types::KeyDerivation,
) -> crate::layout::EncryptionParams {
    crate::layout::EncryptionParams {
        strength: session.strength(),
        key_derivation: Some(derivation),
        session_nonce: session.session_nonce().to_vec(),
        key_check: session.key_check().to_vec(),
    }
}

/// Plaintext (no encryption) layout parameters.
pub fn plaintext_params() -> crate::layout::EncryptionParams {
    crate::layout::EncryptionParams {
        strength: EncryptionStrength::None,
        key_derivation: None,
        session_nonce: Vec::new(),
        key_check: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BlockKey;
    use crate::layout::{CompressionParams, FileLayout};
    use crate::types::{BackupType, CompressionMethod, KeyDerivation};
    use std::io::Cursor;
    use uuid::Uuid;

    fn layout(level: CompressionLevel) -> FileLayout {
        let mut l = FileLayout::new(Vec::new());
        l.compression = CompressionParams { method: CompressionMethod::Zstd, level };
        l
    }

    fn block_content(index: u32) -> Vec<u8> {
        (0..4096u32).map(|i| ((i * 31 + index * 7) % 256) as u8).collect()
    }

    #[test]
    fn write_then_read_plain_container() {
        let mut file = Cursor::new(Vec::new());
        let header = Header::new(Uuid::new_v4(), BackupType::Full, None, 0);
        let def_id = header.definition_id;
        let mut writer =
            ImageWriter::create(&mut file, header, &layout(CompressionLevel::Medium), None)
                .unwrap();
        for i in 0..8u32 {
            writer.write_data_block(i, &block_content(i)).unwrap();
        }
        let done = writer.finalize().unwrap();
        assert_ne!(done.index_offset, 0);

        let mut reader =
            ImageReader::open(Cursor::new(file.into_inner()), FormatCaps::default(), None)
                .unwrap();
        assert_eq!(reader.definition_id(), def_id);
        assert_eq!(reader.index().entries.len(), 8);
        for i in 0..8u32 {
            match reader.read_block(i).unwrap().unwrap() {
                DecodedBlock::Full(data) => assert_eq!(data, block_content(i)),
                DecodedBlock::Delta(_) => panic!("full container produced a delta block"),
            }
        }
        assert!(reader.read_block(99).unwrap().is_none());
    }

    #[test]
    fn encrypted_container_requires_correct_password() {
        let kdf = KeyDerivation::PasswordBased { iterations: 1, salt: b"codec-tests".to_vec() };
        let session =
            CryptoSession::create(crate::types::EncryptionStrength::High, "secret", &kdf).unwrap();

        let mut l = layout(CompressionLevel::Medium);
        l.encryption = encryption_params_for(&session, kdf);

        let mut file = Cursor::new(Vec::new());
        let header = Header::new(Uuid::new_v4(), BackupType::Full, None, 0);
        let mut writer = ImageWriter::create(&mut file, header, &l, Some(session)).unwrap();
        writer.write_data_block(0, &block_content(0)).unwrap();
        writer.finalize().unwrap();
        let bytes = file.into_inner();

        assert!(matches!(
            ImageReader::open(Cursor::new(bytes.clone()), FormatCaps::default(), None),
            Err(CodecError::PasswordRequired)
        ));
        assert!(matches!(
            ImageReader::open(Cursor::new(bytes.clone()), FormatCaps::default(), Some("wrong")),
            Err(CodecError::Crypto(CryptoError::WrongPassword))
        ));

        let mut reader =
            ImageReader::open(Cursor::new(bytes), FormatCaps::default(), Some("secret")).unwrap();
        match reader.read_block(0).unwrap().unwrap() {
            DecodedBlock::Full(data) => assert_eq!(data, block_content(0)),
            DecodedBlock::Delta(_) => panic!("unexpected delta"),
        }
    }

    #[test]
    fn unfinalized_file_is_rejected() {
        let mut file = Cursor::new(Vec::new());
        let header = Header::new(Uuid::new_v4(), BackupType::Full, None, 0);
        let mut writer =
            ImageWriter::create(&mut file, header, &layout(CompressionLevel::None), None)
                .unwrap();
        writer.write_data_block(0, b"data").unwrap();
        drop(writer);

        assert!(matches!(
            ImageReader::open(Cursor::new(file.into_inner()), FormatCaps::default(), None),
            Err(CodecError::Format(FormatError::MissingIndex))
        ));
    }

    #[test]
    fn delta_blocks_set_header_flag_and_roundtrip() {
        let base_def = Uuid::new_v4();
        let base = block_content(1);
        let mut new = base.clone();
        new[100..108].copy_from_slice(b"CHANGED!");
        let delta = DeltaPayload::diff(
            BlockKey { definition_id: base_def, block_index: 1 },
            &base,
            &new,
        );

        let mut file = Cursor::new(Vec::new());
        let header = Header::new(Uuid::new_v4(), BackupType::Incremental, Some(base_def), 1);
        let mut writer =
            ImageWriter::create(&mut file, header, &layout(CompressionLevel::High), None)
                .unwrap();
        writer.write_delta_block(1, &delta, &new).unwrap();
        let done = writer.finalize().unwrap();
        assert_ne!(done.flags & FLAG_DELTA_INDEX, 0);

        let mut reader =
            ImageReader::open(Cursor::new(file.into_inner()), FormatCaps::default(), None)
                .unwrap();
        let entry = reader.index().get(1).unwrap();
        assert_eq!(entry.content_hash(), blake3::hash(&new).as_bytes());
        match reader.read_block(1).unwrap().unwrap() {
            DecodedBlock::Delta(d) => {
                assert_eq!(d.base.definition_id, base_def);
                assert_eq!(d.apply(&base), new);
            }
            DecodedBlock::Full(_) => panic!("expected delta record"),
        }
    }

    #[test]
    fn rewrite_index_re_points_entries() {
        let mut file = Cursor::new(Vec::new());
        let header = Header::new(Uuid::new_v4(), BackupType::Full, None, 0);
        let mut writer =
            ImageWriter::create(&mut file, header, &layout(CompressionLevel::Medium), None)
                .unwrap();
        writer.write_data_block(0, &block_content(0)).unwrap();
        writer.finalize().unwrap();

        let mut bytes = file.into_inner();
        let mut cursor = Cursor::new(&mut bytes);
        let reader = ImageReader::open(&mut cursor, FormatCaps::default(), None).unwrap();
        let mut index = reader.index().clone();
        drop(reader);

        // Simulate a consolidation re-point: same entries, recomputed root.
        index.compute_root_hash();
        let mut cursor = Cursor::new(&mut bytes);
        rewrite_index(&mut cursor, FormatCaps::default(), &index).unwrap();

        let mut reader =
            ImageReader::open(Cursor::new(bytes), FormatCaps::default(), None).unwrap();
        assert_eq!(reader.index().entries.len(), 1);
        match reader.read_block(0).unwrap().unwrap() {
            DecodedBlock::Full(data) => assert_eq!(data, block_content(0)),
            DecodedBlock::Delta(_) => panic!("unexpected delta"),
        }
    }
}
