//! Per-block metadata header and payload encode/decode.
//!
//! Every record after the container header is `MetadataBlockHeader ‖
//! payload`. Encoding composes the compression layer then the crypto layer;
//! decoding reverses them. The CRC32 covers the stored payload exactly as it
//! sits on disk; the BLAKE3 content checksum covers the plaintext,
//! uncompressed block and is what consolidation verification compares.

use crate::compress::{self, CompressionError};
use crate::crypto::{CryptoError, CryptoSession};
use crate::types::CompressionLevel;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub const BLOCK_MAGIC: u32 = 0x5658_424B; // "VXBK"
pub const BLOCK_HEADER_SIZE: usize = 56;

/// Header flag: payload is encrypted.
pub const BF_ENCRYPTED: u16 = 1 << 0;

/// What a block record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// JSON layout snapshot (always the first record).
    Layout,
    /// Full data block for one logical block index.
    Data,
    /// Delta payload: byte ranges that differ from a base block.
    Delta,
    /// Trailing block index.
    Index,
}

impl BlockKind {
    fn to_wire(self) -> u8 {
        match self {
            BlockKind::Layout => 0,
            BlockKind::Data => 1,
            BlockKind::Delta => 2,
            BlockKind::Index => 3,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(BlockKind::Layout),
            1 => Some(BlockKind::Data),
            2 => Some(BlockKind::Delta),
            3 => Some(BlockKind::Index),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("bad block magic at block {block_index}")]
    BadMagic { block_index: u32 },
    #[error("unknown block kind code {0}")]
    UnknownKind(u8),
    #[error("unknown compression level code {0}")]
    UnknownLevel(u8),
    #[error("stored payload checksum mismatch at block {block_index}")]
    ChecksumMismatch { block_index: u32 },
    #[error("content checksum mismatch at block {block_index}")]
    ContentHashMismatch { block_index: u32 },
    #[error("block {block_index} is encrypted but no session key was provided")]
    MissingKey { block_index: u32 },
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct MetadataBlockHeader {
    pub magic: u32,
    pub kind: BlockKind,
    pub level: CompressionLevel,
    pub flags: u16,
    /// Logical block index; zero for layout/index records.
    pub block_index: u32,
    /// Payload bytes as stored on disk (after compression and encryption).
    pub stored_len: u32,
    /// Plaintext, uncompressed length.
    pub orig_len: u32,
    /// CRC32 of the stored payload.
    pub payload_crc32: u32,
    /// BLAKE3 of the plaintext, uncompressed content.
    pub content_hash: [u8; 32],
}

impl MetadataBlockHeader {
    pub fn is_encrypted(&self) -> bool {
        self.flags & BF_ENCRYPTED != 0
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u8(self.kind.to_wire())?;
        writer.write_u8(self.level.to_wire())?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.block_index)?;
        writer.write_u32::<LittleEndian>(self.stored_len)?;
        writer.write_u32::<LittleEndian>(self.orig_len)?;
        writer.write_u32::<LittleEndian>(self.payload_crc32)?;
        writer.write_all(&self.content_hash)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, BlockError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let kind_code = reader.read_u8()?;
        let level_code = reader.read_u8()?;
        let flags = reader.read_u16::<LittleEndian>()?;
        let block_index = reader.read_u32::<LittleEndian>()?;
        if magic != BLOCK_MAGIC {
            return Err(BlockError::BadMagic { block_index });
        }
        let kind = BlockKind::from_wire(kind_code).ok_or(BlockError::UnknownKind(kind_code))?;
        let level =
            CompressionLevel::from_wire(level_code).ok_or(BlockError::UnknownLevel(level_code))?;
        let stored_len = reader.read_u32::<LittleEndian>()?;
        let orig_len = reader.read_u32::<LittleEndian>()?;
        let payload_crc32 = reader.read_u32::<LittleEndian>()?;
        let mut content_hash = [0u8; 32];
        reader.read_exact(&mut content_hash)?;
        Ok(Self {
            magic,
            kind,
            level,
            flags,
            block_index,
            stored_len,
            orig_len,
            payload_crc32,
            content_hash,
        })
    }
}

/// Compress, optionally encrypt, and checksum one block payload.
pub fn encode_block(
    kind: BlockKind,
    block_index: u32,
    data: &[u8],
    level: CompressionLevel,
    session: Option<&CryptoSession>,
) -> Result<(MetadataBlockHeader, Vec<u8>), BlockError> {
    let content_hash: [u8; 32] = *blake3::hash(data).as_bytes();

    let compressed = compress::compress(data, level)?;
    let (stored, flags) = match session {
        Some(s) => (s.encrypt_block(block_index, &compressed)?, BF_ENCRYPTED),
        None => (compressed, 0),
    };

    let header = MetadataBlockHeader {
        magic: BLOCK_MAGIC,
        kind,
        level,
        flags,
        block_index,
        stored_len: stored.len() as u32,
        orig_len: data.len() as u32,
        payload_crc32: crc32fast::hash(&stored),
        content_hash,
    };
    Ok((header, stored))
}

/// Verify, decrypt and decompress one stored block payload. The stored CRC
/// is checked first, then decryption, then decompression with a length
/// cross-check, then the plaintext content checksum.
pub fn decode_block(
    header: &MetadataBlockHeader,
    payload: &[u8],
    session: Option<&CryptoSession>,
) -> Result<Vec<u8>, BlockError> {
    if crc32fast::hash(payload) != header.payload_crc32 {
        return Err(BlockError::ChecksumMismatch { block_index: header.block_index });
    }

    let compressed = if header.is_encrypted() {
        let session =
            session.ok_or(BlockError::MissingKey { block_index: header.block_index })?;
        session.decrypt_block(header.block_index, payload)?
    } else {
        payload.to_vec()
    };

    let data = compress::decompress(&compressed, header.level, header.orig_len as usize)?;

    if *blake3::hash(&data).as_bytes() != header.content_hash {
        return Err(BlockError::ContentHashMismatch { block_index: header.block_index });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncryptionStrength, KeyDerivation};
    use std::io::Cursor;

    fn test_session() -> CryptoSession {
        let kdf = KeyDerivation::PasswordBased { iterations: 1, salt: b"block-tests".to_vec() };
        CryptoSession::create(EncryptionStrength::High, "pw", &kdf).unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let (header, _) =
            encode_block(BlockKind::Data, 42, b"abc", CompressionLevel::Medium, None).unwrap();
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), BLOCK_HEADER_SIZE);
        let back = MetadataBlockHeader::read(Cursor::new(&buf)).unwrap();
        assert_eq!(back.block_index, 42);
        assert_eq!(back.kind, BlockKind::Data);
        assert_eq!(back.content_hash, header.content_hash);
    }

    #[test]
    fn encode_decode_plain() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 256) as u8).collect();
        let (header, stored) =
            encode_block(BlockKind::Data, 0, &data, CompressionLevel::High, None).unwrap();
        assert_eq!(decode_block(&header, &stored, None).unwrap(), data);
    }

    #[test]
    fn encode_decode_encrypted() {
        let session = test_session();
        let data = vec![0xA5u8; 4096];
        let (header, stored) =
            encode_block(BlockKind::Data, 9, &data, CompressionLevel::Medium, Some(&session))
                .unwrap();
        assert!(header.is_encrypted());
        assert_eq!(decode_block(&header, &stored, Some(&session)).unwrap(), data);
    }

    #[test]
    fn flipped_payload_byte_fails_crc() {
        let (header, mut stored) =
            encode_block(BlockKind::Data, 5, b"payload", CompressionLevel::None, None).unwrap();
        stored[0] ^= 0x01;
        assert!(matches!(
            decode_block(&header, &stored, None),
            Err(BlockError::ChecksumMismatch { block_index: 5 })
        ));
    }

    #[test]
    fn encrypted_block_without_key_is_rejected() {
        let session = test_session();
        let (header, stored) =
            encode_block(BlockKind::Data, 1, b"x", CompressionLevel::None, Some(&session)).unwrap();
        assert!(matches!(
            decode_block(&header, &stored, None),
            Err(BlockError::MissingKey { block_index: 1 })
        ));
    }
}
