//! Retention policy evaluation.
//!
//! The evaluator is pure: given a validated set, a configuration, and a
//! clock value, it produces an ordered action list and never touches
//! storage. Keeps come first, then merge/delete pairs oldest-first, so the
//! consolidation engine can execute the list top to bottom.
//!
//! When full, differential and incremental rules overlap on one chain, a
//! definition retained by any rule stays retained. What happens to an
//! expired definition that is still referenced is an explicit configuration
//! choice (`ConflictRule`), not an implicit default: substitute a merge for
//! the delete, or defer and keep it for this round.

use crate::set::{BackupSet, ChainIntegrityError};
use crate::types::{BackupType, ConsolidationType, RetentionPeriod, RetentionType};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

/// One retention rule, scoped to one backup type.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub retention_type: RetentionType,
    pub period: RetentionPeriod,
    /// Count of generations, days or weeks, depending on `period`.
    pub value: u32,
    pub consolidation: ConsolidationType,
}

/// What to do with an expired definition that still has dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictRule {
    /// Substitute an incremental merge for the delete, then delete.
    #[default]
    MergeThenDelete,
    /// Keep the definition this round; a later merge or synthetic full
    /// clears the references first.
    Defer,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionConfig {
    pub rules: Vec<Retention>,
    pub conflict_rule: ConflictRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionAction {
    Keep { definition_id: Uuid },
    /// Absorb `source` into `target` (its base parent).
    Merge { source: Uuid, target: Uuid },
    Delete { definition_id: Uuid },
}

fn rule_matches(rule: RetentionType, backup_type: BackupType) -> bool {
    match rule {
        RetentionType::Full => {
            matches!(backup_type, BackupType::Full | BackupType::SyntheticFull)
        }
        RetentionType::Differential => backup_type == BackupType::Differential,
        RetentionType::Incremental => backup_type == BackupType::Incremental,
    }
}

fn in_window(rule: &Retention, position: usize, created_unix: i64, now: DateTime<Utc>) -> bool {
    match rule.period {
        RetentionPeriod::Count => (position as u32) < rule.value,
        RetentionPeriod::Days => {
            let cutoff = now - Duration::days(rule.value as i64);
            created_unix >= cutoff.timestamp()
        }
        RetentionPeriod::Weeks => {
            let cutoff = now - Duration::weeks(rule.value as i64);
            created_unix >= cutoff.timestamp()
        }
    }
}

/// Evaluate the configured rules against a set.
///
/// Types with no rule are left untouched (kept). A definition outside its
/// window is deleted outright only when nothing depends on it: no child
/// names it as parent and no index holds a delta reference into it.
pub fn evaluate(
    set: &BackupSet,
    config: &RetentionConfig,
    now: DateTime<Utc>,
) -> Result<Vec<RetentionAction>, ChainIntegrityError> {
    set.validate()?;

    let mut expired: Vec<Uuid> = Vec::new();
    let mut kept: Vec<Uuid> = Vec::new();

    for def in set.newest_first() {
        let Some(rule) = config
            .rules
            .iter()
            .find(|r| rule_matches(r.retention_type, def.backup_type))
        else {
            kept.push(def.definition_id);
            continue;
        };
        // Position within this rule's newest-first ordering of its own type.
        let position = set
            .newest_first()
            .iter()
            .filter(|d| rule_matches(rule.retention_type, d.backup_type))
            .position(|d| d.definition_id == def.definition_id)
            .unwrap_or(usize::MAX);
        if in_window(rule, position, def.created_unix, now) {
            kept.push(def.definition_id);
        } else {
            expired.push(def.definition_id);
        }
    }

    // Expired oldest-first, so merges absorb from the base end of the chain.
    expired.sort_by_key(|id| {
        set.definitions()
            .find(|d| d.definition_id == *id)
            .map(|d| (d.created_unix, d.increment_number))
            .unwrap_or_default()
    });

    let mut actions: Vec<RetentionAction> =
        kept.iter().map(|&definition_id| RetentionAction::Keep { definition_id }).collect();

    for id in expired {
        let def = match set.definitions().find(|d| d.definition_id == id) {
            Some(def) => def,
            None => continue,
        };
        let has_dependents = !set.children(id).is_empty() || set.is_referenced(id);
        if !has_dependents {
            debug!(definition = %id, "retention proposes direct delete");
            actions.push(RetentionAction::Delete { definition_id: id });
            continue;
        }
        match (config.conflict_rule, def.parent_id) {
            (ConflictRule::MergeThenDelete, Some(parent)) => {
                debug!(definition = %id, target = %parent, "retention proposes merge then delete");
                actions.push(RetentionAction::Merge { source: id, target: parent });
                actions.push(RetentionAction::Delete { definition_id: id });
            }
            // A root cannot be absorbed upward; keep it until a synthetic
            // full supersedes the chain.
            (ConflictRule::MergeThenDelete, None) | (ConflictRule::Defer, _) => {
                debug!(definition = %id, "retention defers expired definition");
                actions.push(RetentionAction::Keep { definition_id: id });
            }
        }
    }

    Ok(actions)
}
