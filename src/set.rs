//! Backup sets: the definitions that share a set id, their parent chain, and
//! the on-disk store that discovers them.
//!
//! A set is valid when it has exactly one root (a base backup with no
//! parent), every non-root names a parent that exists in the set, and
//! following parent links never revisits a definition. Validation runs when
//! a set is loaded and again before consolidation; everything downstream
//! assumes it holds.

use crate::codec::{CodecError, ImageReader};
use crate::header::FormatCaps;
use crate::index::BlockIndex;
use crate::types::BackupType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChainIntegrityError {
    #[error("set {set_id} has no root full backup")]
    NoRoot { set_id: Uuid },
    #[error("set {set_id} has {count} root backups, expected exactly one")]
    MultipleRoots { set_id: Uuid, count: usize },
    #[error("definition {definition_id} names missing parent {parent_id}")]
    MissingParent { definition_id: Uuid, parent_id: Uuid },
    #[error("parent chain of {definition_id} revisits an ancestor")]
    CycleDetected { definition_id: Uuid },
    #[error("definition {definition_id} appears more than once in the set")]
    DuplicateDefinition { definition_id: Uuid },
    #[error("root definition {definition_id} has non-base type {backup_type:?}")]
    RootNotBase { definition_id: Uuid, backup_type: BackupType },
}

#[derive(Error, Debug)]
pub enum SetError {
    #[error(transparent)]
    Chain(#[from] ChainIntegrityError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown definition {0}")]
    UnknownDefinition(Uuid),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Metadata for one container file, loaded without a password. The layout
/// and index records are never encrypted, so a set can be enumerated and
/// validated before any block is decrypted.
#[derive(Debug, Clone)]
pub struct BackupDefinition {
    pub definition_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub set_id: Uuid,
    pub backup_type: BackupType,
    pub increment_number: u32,
    pub created_unix: i64,
    pub path: PathBuf,
    pub index: BlockIndex,
}

impl BackupDefinition {
    pub fn load(path: &Path, caps: FormatCaps) -> Result<Self, SetError> {
        let file = File::open(path)?;
        let reader = ImageReader::open_metadata(file, caps)?;
        let header = reader.header().clone();
        Ok(Self {
            definition_id: header.definition_id,
            parent_id: header.parent(),
            set_id: header.set_id,
            backup_type: header.backup_type,
            increment_number: header.increment_number,
            created_unix: header.created_unix,
            path: path.to_path_buf(),
            index: reader.index().clone(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Record of a definition absorbed by consolidation. Kept so operators can
/// trace where a deleted increment's data went.
#[derive(Debug, Clone)]
pub struct MergedFile {
    pub definition_id: Uuid,
    pub file_name: String,
    pub merged_into: Uuid,
    pub merged_unix: i64,
}

/// All definitions sharing one set id.
#[derive(Debug, Default)]
pub struct BackupSet {
    pub set_id: Uuid,
    definitions: HashMap<Uuid, BackupDefinition>,
    pub merged_files: Vec<MergedFile>,
}

impl BackupSet {
    pub fn new(set_id: Uuid) -> Self {
        Self { set_id, definitions: HashMap::new(), merged_files: Vec::new() }
    }

    pub fn insert(&mut self, definition: BackupDefinition) -> Result<(), ChainIntegrityError> {
        if self.definitions.contains_key(&definition.definition_id) {
            return Err(ChainIntegrityError::DuplicateDefinition {
                definition_id: definition.definition_id,
            });
        }
        self.definitions.insert(definition.definition_id, definition);
        Ok(())
    }

    pub fn remove(&mut self, definition_id: Uuid) -> Option<BackupDefinition> {
        self.definitions.remove(&definition_id)
    }

    pub fn get(&self, definition_id: Uuid) -> Result<&BackupDefinition, SetError> {
        self.definitions
            .get(&definition_id)
            .ok_or(SetError::UnknownDefinition(definition_id))
    }

    pub fn get_mut(&mut self, definition_id: Uuid) -> Result<&mut BackupDefinition, SetError> {
        self.definitions
            .get_mut(&definition_id)
            .ok_or(SetError::UnknownDefinition(definition_id))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &BackupDefinition> {
        self.definitions.values()
    }

    pub fn root(&self) -> Option<&BackupDefinition> {
        self.definitions.values().find(|d| d.is_root())
    }

    /// Definitions newest first by creation time, ties broken by increment
    /// number so a rapid-fire chain still orders deterministically.
    pub fn newest_first(&self) -> Vec<&BackupDefinition> {
        let mut defs: Vec<&BackupDefinition> = self.definitions.values().collect();
        defs.sort_by(|a, b| {
            b.created_unix
                .cmp(&a.created_unix)
                .then(b.increment_number.cmp(&a.increment_number))
        });
        defs
    }

    pub fn children(&self, definition_id: Uuid) -> Vec<&BackupDefinition> {
        self.definitions
            .values()
            .filter(|d| d.parent_id == Some(definition_id))
            .collect()
    }

    /// Definitions whose index holds a delta back-reference into
    /// `definition_id`. Such a definition cannot be deleted outright.
    pub fn referencing(&self, definition_id: Uuid) -> Vec<&BackupDefinition> {
        self.definitions
            .values()
            .filter(|d| d.index.references(definition_id))
            .collect()
    }

    pub fn is_referenced(&self, definition_id: Uuid) -> bool {
        !self.referencing(definition_id).is_empty()
    }

    /// Parent chain from `definition_id` up to and including the root.
    pub fn chain_to_root(&self, definition_id: Uuid) -> Result<Vec<&BackupDefinition>, SetError> {
        let mut chain = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut current = Some(definition_id);
        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(ChainIntegrityError::CycleDetected { definition_id }.into());
            }
            let def = self.get(id)?;
            current = def.parent_id;
            chain.push(def);
        }
        Ok(chain)
    }

    /// Check the set's structural invariants.
    pub fn validate(&self) -> Result<(), ChainIntegrityError> {
        let roots: Vec<&BackupDefinition> =
            self.definitions.values().filter(|d| d.is_root()).collect();
        match roots.len() {
            0 => return Err(ChainIntegrityError::NoRoot { set_id: self.set_id }),
            1 => {}
            count => return Err(ChainIntegrityError::MultipleRoots { set_id: self.set_id, count }),
        }
        let root = roots[0];
        if !root.backup_type.is_base() {
            return Err(ChainIntegrityError::RootNotBase {
                definition_id: root.definition_id,
                backup_type: root.backup_type,
            });
        }

        for def in self.definitions.values() {
            if let Some(parent_id) = def.parent_id {
                if !self.definitions.contains_key(&parent_id) {
                    return Err(ChainIntegrityError::MissingParent {
                        definition_id: def.definition_id,
                        parent_id,
                    });
                }
            }
            // Walk to the root; a cycle never reaches it.
            let mut visited = std::collections::HashSet::new();
            let mut current = Some(def.definition_id);
            while let Some(id) = current {
                if !visited.insert(id) {
                    return Err(ChainIntegrityError::CycleDetected {
                        definition_id: def.definition_id,
                    });
                }
                current = self.definitions.get(&id).and_then(|d| d.parent_id);
            }
        }
        Ok(())
    }

    pub fn record_merge(&mut self, merged: &BackupDefinition, into: Uuid, at_unix: i64) {
        self.merged_files.push(MergedFile {
            definition_id: merged.definition_id,
            file_name: merged
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            merged_into: into,
            merged_unix: at_unix,
        });
    }
}

/// Directory-backed store of backup sets. Scans a folder for container
/// files, groups them by set id, and validates each chain. Sets are shared
/// behind per-store locks so readers and a consolidation run can coexist.
pub struct SetStore {
    root: PathBuf,
    caps: FormatCaps,
    sets: RwLock<HashMap<Uuid, Arc<RwLock<BackupSet>>>>,
}

impl SetStore {
    pub fn new(root: impl Into<PathBuf>, caps: FormatCaps) -> Self {
        Self { root: root.into(), caps, sets: RwLock::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the store directory and rebuild the set map. Files that fail to
    /// parse are skipped with a warning rather than failing the whole scan.
    pub fn scan(&self) -> Result<usize, SetError> {
        let mut found: HashMap<Uuid, BackupSet> = HashMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("vxi") {
                continue;
            }
            let def = match BackupDefinition::load(&path, self.caps) {
                Ok(def) => def,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable container");
                    continue;
                }
            };
            debug!(
                definition = %def.definition_id,
                set = %def.set_id,
                backup_type = def.backup_type.name(),
                "discovered container"
            );
            found
                .entry(def.set_id)
                .or_insert_with(|| BackupSet::new(def.set_id))
                .insert(def)?;
        }

        for set in found.values() {
            set.validate()?;
        }

        let count = found.len();
        let mut sets = self.sets.write();
        sets.clear();
        for (id, set) in found {
            sets.insert(id, Arc::new(RwLock::new(set)));
        }
        Ok(count)
    }

    pub fn set(&self, set_id: Uuid) -> Option<Arc<RwLock<BackupSet>>> {
        self.sets.read().get(&set_id).cloned()
    }

    pub fn set_ids(&self) -> Vec<Uuid> {
        self.sets.read().keys().copied().collect()
    }

    /// Path for a new container file in this store.
    pub fn container_path(&self, set_id: Uuid, increment_number: u32) -> PathBuf {
        self.root.join(format!("{set_id}-{increment_number:04}.vxi"))
    }
}
