//! Trailing block index and the delta-reference data model.
//!
//! The index is the last record of a container; the header's index pointer
//! is patched only after it has been written in full. Each entry locates one
//! logical block's record in the file and, for delta entries, names the base
//! block through a [`BlockKey`], an explicit (definition id, block index)
//! lookup key, never an in-memory link, so consolidation can rewrite
//! references safely.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use uuid::Uuid;

/// Back-reference to a block owned by another (ancestor) definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub definition_id: Uuid,
    pub block_index: u32,
}

/// One contiguous byte range that differs from the base block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRange {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Payload of a delta block record: the base reference, the length of the
/// resolved content, and the differing ranges. Serialized in binary inside
/// the (compressed, encrypted) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPayload {
    pub base: BlockKey,
    /// Length of the post-delta content. Blocks are fixed-size, but the
    /// last block of a partition may grow or shrink between generations.
    pub resolved_len: u32,
    pub ranges: Vec<DeltaRange>,
}

impl DeltaPayload {
    /// Compute the ranges that turn `base` into `new`. Trailing growth is
    /// emitted as a single range; identical buffers yield no ranges.
    pub fn diff(base_key: BlockKey, base: &[u8], new: &[u8]) -> Self {
        let mut ranges = Vec::new();
        let common = base.len().min(new.len());
        let mut i = 0;
        while i < common {
            if base[i] == new[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < common && base[i] != new[i] {
                i += 1;
            }
            ranges.push(DeltaRange { offset: start as u32, bytes: new[start..i].to_vec() });
        }
        if new.len() > common {
            ranges.push(DeltaRange { offset: common as u32, bytes: new[common..].to_vec() });
        }
        Self { base: base_key, resolved_len: new.len() as u32, ranges }
    }

    /// Apply the ranges on top of resolved base content.
    pub fn apply(&self, base: &[u8]) -> Vec<u8> {
        let mut out = base.to_vec();
        for range in &self.ranges {
            let start = range.offset as usize;
            let end = start + range.bytes.len();
            if end > out.len() {
                out.resize(end, 0);
            }
            out[start..end].copy_from_slice(&range.bytes);
        }
        out.resize(self.resolved_len as usize, 0);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.base.definition_id.as_bytes());
        // Writes to a Vec cannot fail.
        let _ = buf.write_u32::<LittleEndian>(self.base.block_index);
        let _ = buf.write_u32::<LittleEndian>(self.resolved_len);
        let _ = buf.write_u32::<LittleEndian>(self.ranges.len() as u32);
        for range in &self.ranges {
            let _ = buf.write_u32::<LittleEndian>(range.offset);
            let _ = buf.write_u32::<LittleEndian>(range.bytes.len() as u32);
            buf.extend_from_slice(&range.bytes);
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut id = [0u8; 16];
        cursor.read_exact(&mut id)?;
        let block_index = cursor.read_u32::<LittleEndian>()?;
        let resolved_len = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut ranges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cursor.read_u32::<LittleEndian>()?;
            let len = cursor.read_u32::<LittleEndian>()?;
            let mut data = vec![0u8; len as usize];
            cursor.read_exact(&mut data)?;
            ranges.push(DeltaRange { offset, bytes: data });
        }
        Ok(Self {
            base: BlockKey { definition_id: Uuid::from_bytes(id), block_index },
            resolved_len,
            ranges,
        })
    }
}

/// One block's entry in the trailing index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexEntry {
    /// Full data block stored in this file.
    Data {
        block_index: u32,
        file_offset: u64,
        stored_len: u32,
        orig_len: u32,
        /// BLAKE3 of the block content.
        content_hash: [u8; 32],
    },
    /// Delta block stored in this file; content is resolved against `base`.
    Delta {
        block_index: u32,
        file_offset: u64,
        stored_len: u32,
        orig_len: u32,
        /// BLAKE3 of the fully-resolved block content, not the delta payload.
        content_hash: [u8; 32],
        base: BlockKey,
    },
}

impl IndexEntry {
    pub fn block_index(&self) -> u32 {
        match self {
            IndexEntry::Data { block_index, .. } | IndexEntry::Delta { block_index, .. } => {
                *block_index
            }
        }
    }

    pub fn file_offset(&self) -> u64 {
        match self {
            IndexEntry::Data { file_offset, .. } | IndexEntry::Delta { file_offset, .. } => {
                *file_offset
            }
        }
    }

    pub fn content_hash(&self) -> &[u8; 32] {
        match self {
            IndexEntry::Data { content_hash, .. } | IndexEntry::Delta { content_hash, .. } => {
                content_hash
            }
        }
    }

    pub fn base(&self) -> Option<BlockKey> {
        match self {
            IndexEntry::Data { .. } => None,
            IndexEntry::Delta { base, .. } => Some(*base),
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, IndexEntry::Delta { .. })
    }
}

/// The trailing index of one container file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockIndex {
    pub entries: Vec<IndexEntry>,
    /// BLAKE3 over all entry content hashes in block-index order.
    pub root_hash: [u8; 32],
}

impl BlockIndex {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn compute_root_hash(&mut self) {
        let mut hasher = blake3::Hasher::new();
        let mut sorted: Vec<&IndexEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.block_index());
        for entry in sorted {
            hasher.update(entry.content_hash());
        }
        self.root_hash = *hasher.finalize().as_bytes();
    }

    /// Entries keyed by logical block index, ordered.
    pub fn by_block(&self) -> BTreeMap<u32, &IndexEntry> {
        self.entries.iter().map(|e| (e.block_index(), e)).collect()
    }

    pub fn get(&self, block_index: u32) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.block_index() == block_index)
    }

    /// True if any entry holds a delta reference into `definition_id`.
    pub fn references(&self, definition_id: Uuid) -> bool {
        self.entries
            .iter()
            .filter_map(|e| e.base())
            .any(|key| key.definition_id == definition_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delta_diff_and_apply_roundtrip() {
        let base = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut new = base.clone();
        new[4..9].copy_from_slice(b"QUICK");
        new.extend_from_slice(b" again");

        let key = BlockKey { definition_id: Uuid::new_v4(), block_index: 3 };
        let delta = DeltaPayload::diff(key, &base, &new);
        assert!(!delta.ranges.is_empty());
        assert_eq!(delta.apply(&base), new);
    }

    #[test]
    fn identical_blocks_produce_empty_delta() {
        let data = vec![7u8; 512];
        let key = BlockKey { definition_id: Uuid::new_v4(), block_index: 0 };
        let delta = DeltaPayload::diff(key, &data, &data);
        assert!(delta.ranges.is_empty());
        assert_eq!(delta.apply(&data), data);
    }

    #[test]
    fn delta_payload_binary_roundtrip() {
        let key = BlockKey { definition_id: Uuid::new_v4(), block_index: 12 };
        let delta = DeltaPayload {
            base: key,
            resolved_len: 512,
            ranges: vec![
                DeltaRange { offset: 0, bytes: vec![1, 2, 3] },
                DeltaRange { offset: 100, bytes: vec![9; 64] },
            ],
        };
        let bytes = delta.to_bytes();
        let back = DeltaPayload::from_bytes(&bytes).unwrap();
        assert_eq!(back, delta);
    }

    #[test]
    fn index_json_roundtrip_and_references() {
        let other = Uuid::new_v4();
        let mut index = BlockIndex {
            entries: vec![
                IndexEntry::Data {
                    block_index: 0,
                    file_offset: 96,
                    stored_len: 100,
                    orig_len: 512,
                    content_hash: [1; 32],
                },
                IndexEntry::Delta {
                    block_index: 1,
                    file_offset: 300,
                    stored_len: 40,
                    orig_len: 512,
                    content_hash: [2; 32],
                    base: BlockKey { definition_id: other, block_index: 1 },
                },
            ],
            root_hash: [0; 32],
        };
        index.compute_root_hash();

        let bytes = index.to_bytes().unwrap();
        let back = BlockIndex::from_bytes(&bytes).unwrap();
        assert_eq!(back.entries.len(), 2);
        assert_eq!(back.root_hash, index.root_hash);
        assert!(back.references(other));
        assert!(!back.references(Uuid::new_v4()));
        assert_eq!(back.get(1).unwrap().base().unwrap().block_index, 1);
    }

    proptest! {
        #[test]
        fn diff_apply_roundtrips_for_arbitrary_content(
            base in proptest::collection::vec(any::<u8>(), 0..2048),
            new in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let key = BlockKey { definition_id: Uuid::nil(), block_index: 0 };
            let delta = DeltaPayload::diff(key, &base, &new);
            prop_assert_eq!(delta.apply(&base), new.clone());
            let decoded = DeltaPayload::from_bytes(&delta.to_bytes()).unwrap();
            prop_assert_eq!(decoded.apply(&base), new);
        }
    }

    #[test]
    fn root_hash_is_order_independent() {
        let entry = |i: u32, h: u8| IndexEntry::Data {
            block_index: i,
            file_offset: 0,
            stored_len: 0,
            orig_len: 0,
            content_hash: [h; 32],
        };
        let mut a = BlockIndex { entries: vec![entry(0, 1), entry(1, 2)], root_hash: [0; 32] };
        let mut b = BlockIndex { entries: vec![entry(1, 2), entry(0, 1)], root_hash: [0; 32] };
        a.compute_root_hash();
        b.compute_root_hash();
        assert_eq!(a.root_hash, b.root_hash);
    }
}
