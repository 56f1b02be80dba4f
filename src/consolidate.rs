//! Chain consolidation: incremental merge, synthetic-full generation, and
//! retention-driven deletion.
//!
//! Every operation runs the same state machine:
//!
//! ```text
//! Idle -> Planning -> Merging -> Verifying -> Committing -> Done
//!            |           |           |            |
//!            +-----------+-----------+------------+--> Failed -> Idle
//! ```
//!
//! All new data is written to temporary files; until `Committing` begins,
//! rollback is deleting those files and the original containers are
//! untouched byte for byte. The commit itself is ordered so every
//! intermediate state stays readable: the merged container is renamed into
//! place first (it is a superset of what it replaces), survivors whose delta
//! bases changed content are renamed next, parent links are re-pointed, and
//! absorbed files are removed last, after the reshaped set validates.

use crate::codec::{
    self, CodecError, DecodedBlock, ImageReader, ImageWriter,
};
use crate::crypto::CryptoSession;
use crate::header::{FormatCaps, Header};
use crate::index::{BlockIndex, BlockKey, DeltaPayload, IndexEntry};
use crate::retention::RetentionAction;
use crate::set::{BackupDefinition, BackupSet, SetError};
use crate::store::{BlockStore, StoreError, StoreLimits};
use crate::types::{BackupType, EncryptionStrength};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Planning,
    Merging,
    Verifying,
    Committing,
    Done,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Planning => "planning",
            EngineState::Merging => "merging",
            EngineState::Verifying => "verifying",
            EngineState::Committing => "committing",
            EngineState::Done => "done",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ConsolidationError {
    #[error("cannot merge root definition {0} into a parent")]
    CannotMergeRoot(Uuid),
    #[error("merge target {target} of {merge_source} is not a base backup")]
    MergeTargetNotBase { merge_source: Uuid, target: Uuid },
    #[error("verification of block {block_index} in {definition_id} failed after merge")]
    ConsolidationVerificationFailed { definition_id: Uuid, block_index: u32 },
    #[error("definition {definition_id} still has dependents; deletion deferred")]
    DeletionDeferred { definition_id: Uuid },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Set(#[from] SetError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result summary of one incremental merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub source: Uuid,
    pub target: Uuid,
    pub blocks_written: u32,
}

/// Summary of executing a retention action list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyReport {
    pub merged: u32,
    pub deleted: u32,
    pub deferred: u32,
}

pub struct ConsolidationEngine {
    caps: FormatCaps,
    limits: StoreLimits,
    password: Option<String>,
    state: EngineState,
}

impl ConsolidationEngine {
    pub fn new(caps: FormatCaps, limits: StoreLimits, password: Option<&str>) -> Self {
        Self { caps, limits, password: password.map(str::to_owned), state: EngineState::Idle }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn transition(&mut self, to: EngineState) {
        info!(from = %self.state, to = %to, "consolidation state");
        self.state = to;
    }

    fn fail_and_rollback(&mut self, tmps: &[PathBuf]) {
        self.transition(EngineState::Failed);
        for tmp in tmps {
            if tmp.exists() {
                if let Err(err) = fs::remove_file(tmp) {
                    warn!(path = %tmp.display(), error = %err, "rollback could not remove temp file");
                }
            }
        }
        self.transition(EngineState::Idle);
    }

    /// Absorb `source_id` into its parent base backup, producing a new full
    /// definition under the parent's id. Descendants that referenced the
    /// absorbed definition are re-pointed to the merge result.
    pub fn merge(
        &mut self,
        set: &mut BackupSet,
        source_id: Uuid,
    ) -> Result<MergeOutcome, ConsolidationError> {
        let mut tmps = Vec::new();
        match self.merge_inner(set, source_id, &mut tmps) {
            Ok(outcome) => {
                self.transition(EngineState::Done);
                self.transition(EngineState::Idle);
                Ok(outcome)
            }
            Err(err) => {
                self.fail_and_rollback(&tmps);
                Err(err)
            }
        }
    }

    fn merge_inner(
        &mut self,
        set: &mut BackupSet,
        source_id: Uuid,
        tmps: &mut Vec<PathBuf>,
    ) -> Result<MergeOutcome, ConsolidationError> {
        self.transition(EngineState::Planning);
        set.validate().map_err(SetError::from)?;

        let source = set.get(source_id)?.clone();
        let target_id = source
            .parent_id
            .ok_or(ConsolidationError::CannotMergeRoot(source_id))?;
        let target = set.get(target_id)?.clone();
        if !target.backup_type.is_base() {
            return Err(ConsolidationError::MergeTargetNotBase {
                merge_source: source_id,
                target: target_id,
            });
        }

        // Resolve the post-merge content of every block up front; these are
        // both the bytes to write and the expected values for verification.
        let mut store = BlockStore::for_set(set, self.caps, self.limits, self.password.as_deref());
        let mut resolved: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for entry in &target.index.entries {
            let block_index = entry.block_index();
            resolved.insert(block_index, store.read_block_at(target_id, block_index)?);
        }
        let mut changed = HashSet::new();
        for entry in &source.index.entries {
            let block_index = entry.block_index();
            resolved.insert(block_index, store.read_block_at(source_id, block_index)?);
            changed.insert(block_index);
        }

        // A survivor whose delta ranges were diffed against target content
        // the merge overwrites must be re-diffed against the new content.
        // Survivors that only reference the absorbed definition keep
        // identical base content; their keys are remapped in place.
        let others: Vec<BackupDefinition> = set
            .definitions()
            .filter(|d| d.definition_id != source_id && d.definition_id != target_id)
            .cloned()
            .collect();
        let mut rewrites: Vec<ContainerRewrite> = Vec::new();
        let mut repoint: Vec<Uuid> = Vec::new();
        for def in others {
            let rediff = def.index.entries.iter().any(|e| {
                e.base().is_some_and(|b| {
                    b.definition_id == target_id && changed.contains(&b.block_index)
                })
            });
            if rediff {
                let blocks = plan_rewrite(&mut store, &def, &[source_id], target_id, &resolved)?;
                let parent = if def.parent_id == Some(source_id) {
                    Some(target_id)
                } else {
                    def.parent_id
                };
                let tmp = def.path.with_extension("vxi.tmp");
                rewrites.push(ContainerRewrite { def, parent, blocks, tmp });
            } else if def.index.references(source_id) {
                repoint.push(def.definition_id);
            }
        }

        self.transition(EngineState::Merging);
        let merged_tmp = target.path.with_extension("vxi.tmp");
        tmps.push(merged_tmp.clone());
        let header = self.merged_header(&target, target.increment_number);
        let blocks_written =
            self.write_full_container(&target.path, &merged_tmp, header, &resolved)?;
        for rewrite in &rewrites {
            tmps.push(rewrite.tmp.clone());
            self.write_rewritten_container(rewrite)?;
        }

        self.transition(EngineState::Verifying);
        self.verify_container(&merged_tmp, &resolved)?;
        for rewrite in &rewrites {
            self.verify_rewritten(rewrite)?;
        }

        self.transition(EngineState::Committing);
        fs::rename(&merged_tmp, &target.path)?;
        for rewrite in &rewrites {
            fs::rename(&rewrite.tmp, &rewrite.def.path)?;
        }
        for id in &repoint {
            let path = set.get(*id)?.path.clone();
            rewrite_references(&path, self.caps, &[source_id], target_id)?;
        }
        let rewritten: HashSet<Uuid> =
            rewrites.iter().map(|r| r.def.definition_id).collect();
        let children: Vec<Uuid> =
            set.children(source_id).into_iter().map(|d| d.definition_id).collect();
        for id in &children {
            if rewritten.contains(id) {
                continue; // the rewritten container already carries the new parent
            }
            let path = set.get(*id)?.path.clone();
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            codec::rewrite_parent(&mut file, self.caps, Some(target_id))?;
        }
        fs::remove_file(&source.path)?;

        let now = chrono::Utc::now().timestamp();
        set.record_merge(&source, target_id, now);
        set.remove(source_id);
        reload(set, target_id, &target.path, self.caps)?;
        for id in repoint.iter().chain(children.iter()).chain(rewritten.iter()) {
            let path = set.get(*id)?.path.clone();
            reload(set, *id, &path, self.caps)?;
        }
        set.validate().map_err(SetError::from)?;

        info!(
            source = %source_id,
            target = %target_id,
            blocks = blocks_written,
            rewritten = rewrites.len(),
            "incremental merge committed"
        );
        Ok(MergeOutcome { source: source_id, target: target_id, blocks_written })
    }

    /// Merge the oldest incremental whose parent is a base backup. Returns
    /// `None` when the chain has nothing left to absorb, so repeated calls
    /// settle into a no-op.
    pub fn merge_oldest(
        &mut self,
        set: &mut BackupSet,
    ) -> Result<Option<MergeOutcome>, ConsolidationError> {
        let candidate = set
            .newest_first()
            .into_iter()
            .rev()
            .find(|d| {
                d.backup_type == BackupType::Incremental
                    && d.parent_id
                        .and_then(|p| set.get(p).ok())
                        .map(|p| p.backup_type.is_base())
                        .unwrap_or(false)
            })
            .map(|d| d.definition_id);
        match candidate {
            Some(source_id) => Ok(Some(self.merge(set, source_id)?)),
            None => Ok(None),
        }
    }

    /// Replay the chain root to `target_id` and emit a root-equivalent
    /// definition of full blocks only. The replayed chain is superseded:
    /// survivors branching off any replayed ancestor are re-pointed to the
    /// new definition, then the chain files are removed. Returns the new
    /// definition id.
    pub fn synthetic_full(
        &mut self,
        set: &mut BackupSet,
        target_id: Uuid,
    ) -> Result<Uuid, ConsolidationError> {
        let mut tmps = Vec::new();
        match self.synthetic_full_inner(set, target_id, &mut tmps) {
            Ok(new_id) => {
                self.transition(EngineState::Done);
                self.transition(EngineState::Idle);
                Ok(new_id)
            }
            Err(err) => {
                self.fail_and_rollback(&tmps);
                Err(err)
            }
        }
    }

    fn synthetic_full_inner(
        &mut self,
        set: &mut BackupSet,
        target_id: Uuid,
        tmps: &mut Vec<PathBuf>,
    ) -> Result<Uuid, ConsolidationError> {
        self.transition(EngineState::Planning);
        set.validate().map_err(SetError::from)?;

        let target = set.get(target_id)?.clone();
        let chain: Vec<Uuid> =
            set.chain_to_root(target_id)?.into_iter().map(|d| d.definition_id).collect();

        let mut store = BlockStore::for_set(set, self.caps, self.limits, self.password.as_deref());
        let overlay = store.overlay_index(target_id)?;
        let mut resolved: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for (&block_index, &owner) in &overlay {
            resolved.insert(block_index, store.read_block_at(owner, block_index)?);
        }

        // A survivor may hold delta keys into any replayed ancestor, and its
        // ranges were diffed against that ancestor's content, not the
        // flattened replay. Those survivors are re-diffed against the
        // synthetic content; survivors that merely hang off the chain get a
        // new parent link.
        let new_id = Uuid::new_v4();
        let survivors: Vec<BackupDefinition> = set
            .definitions()
            .filter(|d| !chain.contains(&d.definition_id))
            .cloned()
            .collect();
        let mut rewrites: Vec<ContainerRewrite> = Vec::new();
        let mut reparent: Vec<Uuid> = Vec::new();
        for def in survivors {
            let references_chain = def
                .index
                .entries
                .iter()
                .filter_map(|e| e.base())
                .any(|b| chain.contains(&b.definition_id));
            let parent_in_chain = def.parent_id.is_some_and(|p| chain.contains(&p));
            if references_chain {
                let blocks = plan_rewrite(&mut store, &def, &chain, new_id, &resolved)?;
                let parent = if parent_in_chain { Some(new_id) } else { def.parent_id };
                let tmp = def.path.with_extension("vxi.tmp");
                rewrites.push(ContainerRewrite { def, parent, blocks, tmp });
            } else if parent_in_chain {
                reparent.push(def.definition_id);
            }
        }

        self.transition(EngineState::Merging);
        let mut header = self.merged_header(&target, target.increment_number);
        header.definition_id = new_id;
        header.backup_type = BackupType::SyntheticFull;
        let final_path = target.path.with_file_name(format!("{new_id}.vxi"));
        let synth_tmp = target.path.with_extension("vxi.tmp");
        tmps.push(synth_tmp.clone());
        self.write_full_container(&target.path, &synth_tmp, header, &resolved)?;
        for rewrite in &rewrites {
            tmps.push(rewrite.tmp.clone());
            self.write_rewritten_container(rewrite)?;
        }

        self.transition(EngineState::Verifying);
        self.verify_container(&synth_tmp, &resolved)?;
        for rewrite in &rewrites {
            self.verify_rewritten(rewrite)?;
        }

        self.transition(EngineState::Committing);
        fs::rename(&synth_tmp, &final_path)?;
        for rewrite in &rewrites {
            fs::rename(&rewrite.tmp, &rewrite.def.path)?;
        }
        for id in &reparent {
            let path = set.get(*id)?.path.clone();
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            codec::rewrite_parent(&mut file, self.caps, Some(new_id))?;
        }

        // The replayed files are removed only after the reshaped set
        // validates; a failure up to that point leaves every original
        // container on disk.
        let now = chrono::Utc::now().timestamp();
        let mut absorbed = Vec::new();
        for id in &chain {
            if let Some(def) = set.remove(*id) {
                set.record_merge(&def, new_id, now);
                absorbed.push(def);
            }
        }
        set.insert(BackupDefinition::load(&final_path, self.caps)?)
            .map_err(SetError::from)?;
        for rewrite in &rewrites {
            reload(set, rewrite.def.definition_id, &rewrite.def.path, self.caps)?;
        }
        for id in &reparent {
            let path = set.get(*id)?.path.clone();
            reload(set, *id, &path, self.caps)?;
        }
        set.validate().map_err(SetError::from)?;
        for def in &absorbed {
            fs::remove_file(&def.path)?;
        }

        info!(target = %target_id, synthetic = %new_id, replayed = chain.len(), "synthetic full committed");
        Ok(new_id)
    }

    /// Remove a definition outright. Refused while any surviving definition
    /// names it as parent or holds a delta reference into it.
    pub fn delete(
        &mut self,
        set: &mut BackupSet,
        definition_id: Uuid,
    ) -> Result<(), ConsolidationError> {
        let def = set.get(definition_id)?.clone();
        if !set.children(definition_id).is_empty() || set.is_referenced(definition_id) {
            return Err(ConsolidationError::DeletionDeferred { definition_id });
        }
        fs::remove_file(&def.path)?;
        set.remove(definition_id);
        info!(definition = %definition_id, "definition deleted");
        Ok(())
    }

    /// Execute a retention action list in order. The plan may be stale by
    /// the time an action runs: merges whose target was already absorbed are
    /// no-ops, merges whose parent is no longer a base and deletes still
    /// blocked by dependents are deferred, not errors.
    pub fn apply(
        &mut self,
        set: &mut BackupSet,
        actions: &[RetentionAction],
    ) -> Result<ApplyReport, ConsolidationError> {
        let mut report = ApplyReport::default();
        for action in actions {
            match *action {
                RetentionAction::Keep { .. } => {}
                RetentionAction::Merge { source, .. } => {
                    if set.get(source).is_err() {
                        continue;
                    }
                    match self.merge(set, source) {
                        Ok(_) => report.merged += 1,
                        Err(ConsolidationError::MergeTargetNotBase { .. }) => {
                            warn!(definition = %source, "merge deferred: parent is not a base backup");
                            report.deferred += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
                RetentionAction::Delete { definition_id } => {
                    if set.get(definition_id).is_err() {
                        continue;
                    }
                    match self.delete(set, definition_id) {
                        Ok(()) => report.deleted += 1,
                        Err(ConsolidationError::DeletionDeferred { .. }) => {
                            warn!(definition = %definition_id, "delete deferred: still referenced");
                            report.deferred += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(report)
    }

    fn merged_header(&self, template: &BackupDefinition, increment_number: u32) -> Header {
        let mut header =
            Header::new(template.set_id, BackupType::Full, None, increment_number);
        header.definition_id = template.definition_id;
        // The merge result stands in for the original base; keeping its
        // timestamp keeps retention windows stable across consolidations.
        header.created_unix = template.created_unix;
        header
    }

    /// Open a writer for a fresh container at `tmp`, copying the layout of
    /// `layout_source`. An encrypted layout gets a fresh session nonce so
    /// block nonces never repeat across the old and new files.
    fn begin_container(
        &self,
        layout_source: &Path,
        tmp: &Path,
        header: Header,
    ) -> Result<ImageWriter<fs::File>, ConsolidationError> {
        let source_file = fs::File::open(layout_source)?;
        let mut layout = ImageReader::open_metadata(source_file, self.caps)?.layout().clone();

        let session = if layout.encryption.strength == EncryptionStrength::None {
            None
        } else {
            let password =
                self.password.as_deref().ok_or(CodecError::PasswordRequired)?;
            let derivation = layout
                .encryption
                .key_derivation
                .clone()
                .ok_or(CodecError::PasswordRequired)?;
            let session = CryptoSession::create(layout.encryption.strength, password, &derivation)
                .map_err(CodecError::from)?;
            layout.encryption = codec::encryption_params_for(&session, derivation);
            Some(session)
        };

        let file = fs::File::create(tmp)?;
        Ok(ImageWriter::create(file, header, &layout, session)?)
    }

    /// Write all resolved blocks into a fresh container at `tmp`.
    fn write_full_container(
        &self,
        layout_source: &Path,
        tmp: &Path,
        header: Header,
        resolved: &BTreeMap<u32, Vec<u8>>,
    ) -> Result<u32, ConsolidationError> {
        let mut writer = self.begin_container(layout_source, tmp, header)?;
        let mut blocks_written = 0u32;
        for (&block_index, content) in resolved {
            writer.write_data_block(block_index, content)?;
            blocks_written += 1;
        }
        writer.finalize()?;
        Ok(blocks_written)
    }

    /// Rewrite a survivor container whose delta bases changed content: data
    /// blocks are re-emitted as-is, delta blocks are re-diffed against their
    /// (possibly remapped) base content. The definition keeps its identity.
    fn write_rewritten_container(
        &self,
        rewrite: &ContainerRewrite,
    ) -> Result<(), ConsolidationError> {
        let def = &rewrite.def;
        let mut header =
            Header::new(def.set_id, def.backup_type, rewrite.parent, def.increment_number);
        header.definition_id = def.definition_id;
        header.created_unix = def.created_unix;

        let mut writer = self.begin_container(&def.path, &rewrite.tmp, header)?;
        for block in &rewrite.blocks {
            match block {
                RewriteBlock::Data { block_index, content } => {
                    writer.write_data_block(*block_index, content)?;
                }
                RewriteBlock::Delta { block_index, content, base, base_content } => {
                    let delta = DeltaPayload::diff(*base, base_content, content);
                    writer.write_delta_block(*block_index, &delta, content)?;
                }
            }
        }
        writer.finalize()?;
        Ok(())
    }

    /// Check a rewritten container block by block against the planned
    /// content: full blocks compare directly, delta blocks are applied to
    /// their planned base content first.
    fn verify_rewritten(&self, rewrite: &ContainerRewrite) -> Result<(), ConsolidationError> {
        let file = fs::File::open(&rewrite.tmp)?;
        let mut reader = ImageReader::open(file, self.caps, self.password.as_deref())?;
        let definition_id = reader.definition_id();
        for block in &rewrite.blocks {
            let (block_index, expected) = match block {
                RewriteBlock::Data { block_index, content }
                | RewriteBlock::Delta { block_index, content, .. } => (*block_index, content),
            };
            let ok = match (reader.read_block(block_index)?, block) {
                (Some(DecodedBlock::Full(data)), RewriteBlock::Data { .. }) => data == *expected,
                (
                    Some(DecodedBlock::Delta(delta)),
                    RewriteBlock::Delta { base_content, .. },
                ) => delta.apply(base_content) == *expected,
                _ => false,
            };
            if !ok {
                return Err(ConsolidationError::ConsolidationVerificationFailed {
                    definition_id,
                    block_index,
                });
            }
        }
        Ok(())
    }

    /// Compare every block of the new container against the pre-merge
    /// resolved content.
    fn verify_container(
        &self,
        path: &Path,
        expected: &BTreeMap<u32, Vec<u8>>,
    ) -> Result<(), ConsolidationError> {
        let file = fs::File::open(path)?;
        let mut reader = ImageReader::open(file, self.caps, self.password.as_deref())?;
        let definition_id = reader.definition_id();
        for (&block_index, content) in expected {
            match reader.read_block(block_index)? {
                Some(DecodedBlock::Full(data)) if data == *content => {}
                _ => {
                    return Err(ConsolidationError::ConsolidationVerificationFailed {
                        definition_id,
                        block_index,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A survivor container scheduled for a full re-encode during commit.
struct ContainerRewrite {
    def: BackupDefinition,
    parent: Option<Uuid>,
    blocks: Vec<RewriteBlock>,
    tmp: PathBuf,
}

/// One block of a planned container rewrite, resolved before any file is
/// touched.
enum RewriteBlock {
    Data {
        block_index: u32,
        content: Vec<u8>,
    },
    Delta {
        block_index: u32,
        content: Vec<u8>,
        base: BlockKey,
        base_content: Vec<u8>,
    },
}

/// Plan the rewrite of one container: resolve every block's content, remap
/// delta keys out of `absorbed` onto `new_base_id`, and capture the base
/// content each delta will be re-diffed against. `new_base` is the block
/// content of the definition the absorbed ones collapse into.
fn plan_rewrite(
    store: &mut BlockStore,
    def: &BackupDefinition,
    absorbed: &[Uuid],
    new_base_id: Uuid,
    new_base: &BTreeMap<u32, Vec<u8>>,
) -> Result<Vec<RewriteBlock>, ConsolidationError> {
    let mut blocks = Vec::with_capacity(def.index.entries.len());
    for entry in &def.index.entries {
        let block_index = entry.block_index();
        let content = store.read_block_at(def.definition_id, block_index)?;
        match entry.base() {
            None => blocks.push(RewriteBlock::Data { block_index, content }),
            Some(base) => {
                let base = if absorbed.contains(&base.definition_id) {
                    BlockKey { definition_id: new_base_id, block_index: base.block_index }
                } else {
                    base
                };
                let base_content = if base.definition_id == new_base_id {
                    new_base
                        .get(&base.block_index)
                        .cloned()
                        .ok_or(StoreError::MissingBaseBlock(new_base_id, base.block_index))?
                } else {
                    store.read_block_at(base.definition_id, base.block_index)?
                };
                blocks.push(RewriteBlock::Delta { block_index, content, base, base_content });
            }
        }
    }
    Ok(blocks)
}

/// Rewrite a container's index so every delta key into one of `from` points
/// at `to` instead, keeping block indexes unchanged.
fn rewrite_references(
    path: &PathBuf,
    caps: FormatCaps,
    from: &[Uuid],
    to: Uuid,
) -> Result<(), ConsolidationError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let reader = ImageReader::open_metadata(&mut file, caps)?;
    let mut index: BlockIndex = reader.index().clone();
    drop(reader);

    let mut changed = false;
    for entry in &mut index.entries {
        if let IndexEntry::Delta { base, .. } = entry {
            if from.contains(&base.definition_id) {
                *base = BlockKey { definition_id: to, block_index: base.block_index };
                changed = true;
            }
        }
    }
    if changed {
        index.compute_root_hash();
        codec::rewrite_index(&mut file, caps, &index)?;
    }
    Ok(())
}

fn reload(
    set: &mut BackupSet,
    definition_id: Uuid,
    path: &Path,
    caps: FormatCaps,
) -> Result<(), ConsolidationError> {
    set.remove(definition_id);
    set.insert(BackupDefinition::load(path, caps)?).map_err(SetError::from)?;
    Ok(())
}
