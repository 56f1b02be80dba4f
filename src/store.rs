//! Block resolution across a backup set.
//!
//! Two lookup mechanisms compose here. The overlay walk finds which
//! definition in the parent chain owns the newest record for a logical block
//! (an incremental only stores what changed). Delta resolution then follows
//! explicit `BlockKey` base references until a full block is reached, applies
//! the accumulated ranges newest-last, and checks the resolved content hash.
//!
//! Both walks are bounded: a visited set catches reference cycles in
//! corrupted indexes, and a depth limit rejects chains deeper than any
//! well-formed set produces.

use crate::codec::{CodecError, DecodedBlock, ImageReader};
use crate::header::FormatCaps;
use crate::index::BlockKey;
use crate::set::{BackupSet, SetError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Hard ceilings on chain walks.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_chain_depth: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self { max_chain_depth: 64 }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("delta chain for block {block_index} of {definition_id} exceeds depth {max_depth}")]
    ChainTooDeep { definition_id: Uuid, block_index: u32, max_depth: u32 },
    #[error("delta chain for block {block_index} of {definition_id} revisits a block")]
    DeltaCycleDetected { definition_id: Uuid, block_index: u32 },
    #[error("block {1} referenced in {0} does not exist")]
    MissingBaseBlock(Uuid, u32),
    #[error("resolved block {block_index} of {definition_id} does not match its index hash")]
    ResolvedHashMismatch { definition_id: Uuid, block_index: u32 },
    #[error(transparent)]
    Set(#[from] SetError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-side access to every container of one set, with delta resolution.
///
/// Readers are opened lazily per definition and cached. One password covers
/// the whole set; unencrypted containers ignore it.
pub struct BlockStore {
    caps: FormatCaps,
    limits: StoreLimits,
    password: Option<String>,
    paths: HashMap<Uuid, PathBuf>,
    parents: HashMap<Uuid, Option<Uuid>>,
    readers: HashMap<Uuid, ImageReader<File>>,
}

impl BlockStore {
    pub fn for_set(
        set: &BackupSet,
        caps: FormatCaps,
        limits: StoreLimits,
        password: Option<&str>,
    ) -> Self {
        let mut paths = HashMap::new();
        let mut parents = HashMap::new();
        for def in set.definitions() {
            paths.insert(def.definition_id, def.path.clone());
            parents.insert(def.definition_id, def.parent_id);
        }
        Self {
            caps,
            limits,
            password: password.map(str::to_owned),
            paths,
            parents,
            readers: HashMap::new(),
        }
    }

    fn reader(&mut self, definition_id: Uuid) -> Result<&mut ImageReader<File>, StoreError> {
        if !self.readers.contains_key(&definition_id) {
            let path = self
                .paths
                .get(&definition_id)
                .ok_or(SetError::UnknownDefinition(definition_id))?;
            let file = File::open(path)?;
            let reader = ImageReader::open(file, self.caps, self.password.as_deref())?;
            self.readers.insert(definition_id, reader);
        }
        // Just inserted or already present.
        Ok(self.readers.get_mut(&definition_id).ok_or(SetError::UnknownDefinition(definition_id))?)
    }

    /// Resolve the record stored for `block_index` in exactly this
    /// definition, following delta base references down to a full block.
    pub fn read_block_at(
        &mut self,
        definition_id: Uuid,
        block_index: u32,
    ) -> Result<Vec<u8>, StoreError> {
        let mut visited = HashSet::new();
        let content = self.resolve(definition_id, block_index, 0, &mut visited)?;
        self.check_resolved_hash(definition_id, block_index, &content)?;
        Ok(content)
    }

    /// The state of `block_index` as seen at `definition_id`: the nearest
    /// record in the parent chain, delta-resolved. `None` means the block
    /// was never captured anywhere in the chain.
    pub fn read_block(
        &mut self,
        definition_id: Uuid,
        block_index: u32,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(owner) = self.owner_of(definition_id, block_index)? else {
            return Ok(None);
        };
        Ok(Some(self.read_block_at(owner, block_index)?))
    }

    /// Which definition in the parent chain holds the newest record for
    /// `block_index`, if any.
    pub fn owner_of(
        &mut self,
        definition_id: Uuid,
        block_index: u32,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut current = Some(definition_id);
        let mut hops = 0u32;
        while let Some(id) = current {
            if hops > self.limits.max_chain_depth {
                return Err(StoreError::ChainTooDeep {
                    definition_id,
                    block_index,
                    max_depth: self.limits.max_chain_depth,
                });
            }
            let has_entry = self.reader(id)?.index().get(block_index).is_some();
            if has_entry {
                return Ok(Some(id));
            }
            current = self
                .parents
                .get(&id)
                .copied()
                .ok_or(SetError::UnknownDefinition(id))?;
            hops += 1;
        }
        Ok(None)
    }

    /// The overlay index at `definition_id`: every captured block mapped to
    /// the definition owning its newest record, root entries shadowed by
    /// descendants.
    pub fn overlay_index(
        &mut self,
        definition_id: Uuid,
    ) -> Result<BTreeMap<u32, Uuid>, StoreError> {
        // Collect the chain leaf-to-root, then overlay root-to-leaf.
        let mut chain = Vec::new();
        let mut current = Some(definition_id);
        let mut hops = 0u32;
        while let Some(id) = current {
            if hops > self.limits.max_chain_depth {
                return Err(StoreError::ChainTooDeep {
                    definition_id,
                    block_index: 0,
                    max_depth: self.limits.max_chain_depth,
                });
            }
            chain.push(id);
            current = self
                .parents
                .get(&id)
                .copied()
                .ok_or(SetError::UnknownDefinition(id))?;
            hops += 1;
        }

        let mut overlay = BTreeMap::new();
        for id in chain.into_iter().rev() {
            let indices: Vec<u32> =
                self.reader(id)?.index().entries.iter().map(|e| e.block_index()).collect();
            for block_index in indices {
                overlay.insert(block_index, id);
            }
        }
        Ok(overlay)
    }

    fn resolve(
        &mut self,
        definition_id: Uuid,
        block_index: u32,
        depth: u32,
        visited: &mut HashSet<(Uuid, u32)>,
    ) -> Result<Vec<u8>, StoreError> {
        if depth > self.limits.max_chain_depth {
            return Err(StoreError::ChainTooDeep {
                definition_id,
                block_index,
                max_depth: self.limits.max_chain_depth,
            });
        }
        if !visited.insert((definition_id, block_index)) {
            return Err(StoreError::DeltaCycleDetected { definition_id, block_index });
        }

        let decoded = self
            .reader(definition_id)?
            .read_block(block_index)?
            .ok_or(StoreError::MissingBaseBlock(definition_id, block_index))?;

        match decoded {
            DecodedBlock::Full(data) => Ok(data),
            DecodedBlock::Delta(delta) => {
                trace!(
                    definition = %definition_id,
                    block_index,
                    base = %delta.base.definition_id,
                    depth,
                    "following delta base reference"
                );
                let base = self.resolve(
                    delta.base.definition_id,
                    delta.base.block_index,
                    depth + 1,
                    visited,
                )?;
                Ok(delta.apply(&base))
            }
        }
    }

    fn check_resolved_hash(
        &mut self,
        definition_id: Uuid,
        block_index: u32,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let stored = self
            .reader(definition_id)?
            .index()
            .get(block_index)
            .map(|e| *e.content_hash());
        if let Some(expected) = stored {
            if *blake3::hash(content).as_bytes() != expected {
                return Err(StoreError::ResolvedHashMismatch { definition_id, block_index });
            }
        }
        Ok(())
    }

    /// Re-resolve every block of a definition and check it against the index
    /// hash. Returns the number of blocks verified.
    pub fn verify(&mut self, definition_id: Uuid) -> Result<u32, StoreError> {
        let indices: Vec<u32> = self
            .reader(definition_id)?
            .index()
            .entries
            .iter()
            .map(|e| e.block_index())
            .collect();
        let mut checked = 0u32;
        for block_index in indices {
            self.read_block_at(definition_id, block_index)?;
            checked += 1;
        }
        Ok(checked)
    }

    /// Base references from `definition_id` grouped by referenced definition.
    pub fn base_references(&mut self, definition_id: Uuid) -> Result<Vec<BlockKey>, StoreError> {
        Ok(self
            .reader(definition_id)?
            .index()
            .entries
            .iter()
            .filter_map(|e| e.base())
            .collect())
    }

    /// Drop the cached reader for a definition, e.g. after its file was
    /// rewritten by consolidation.
    pub fn invalidate(&mut self, definition_id: Uuid) {
        self.readers.remove(&definition_id);
    }

    /// Write the fully-resolved image as seen at `definition_id` as one
    /// contiguous stream, logical block 0 first. Blocks never captured are
    /// emitted as `block_size` zeroes; captured blocks are written at their
    /// resolved length (only the last block of a partition may be short).
    /// Returns the number of bytes written.
    pub fn export<W: std::io::Write>(
        &mut self,
        definition_id: Uuid,
        block_size: usize,
        mut writer: W,
    ) -> Result<u64, StoreError> {
        let overlay = self.overlay_index(definition_id)?;
        let Some((&max_index, _)) = overlay.iter().next_back() else {
            return Ok(0);
        };
        let zeroes = vec![0u8; block_size];
        let mut written = 0u64;
        for block_index in 0..=max_index {
            match overlay.get(&block_index) {
                Some(&owner) => {
                    let data = self.read_block_at(owner, block_index)?;
                    writer.write_all(&data)?;
                    written += data.len() as u64;
                }
                None => {
                    writer.write_all(&zeroes)?;
                    written += block_size as u64;
                }
            }
        }
        Ok(written)
    }

    /// Re-point a definition's file path after a consolidation rename.
    pub fn repoint(&mut self, definition_id: Uuid, path: PathBuf, parent: Option<Uuid>) {
        self.paths.insert(definition_id, path);
        self.parents.insert(definition_id, parent);
        self.readers.remove(&definition_id);
    }
}
