//! Structured result of a reconciliation pass

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{ConflictEntry, EntityKind, RecordId};

/// Outcome of one pass.
///
/// `success` is false whenever any per-record error was collected; counters
/// still reflect the work that did complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: bool,
    pub pushed: BTreeMap<EntityKind, u64>,
    pub pulled: BTreeMap<EntityKind, u64>,
    pub conflicts: Vec<ConflictEntry>,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// Empty report with a zero counter for every kind.
    pub fn new() -> Self {
        let zeros = EntityKind::ALL.into_iter().map(|kind| (kind, 0)).collect::<BTreeMap<_, _>>();
        Self {
            success: true,
            pushed: zeros.clone(),
            pulled: zeros,
            conflicts: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn count_pushed(&mut self, kind: EntityKind) {
        *self.pushed.entry(kind).or_default() += 1;
    }

    pub fn count_pulled(&mut self, kind: EntityKind) {
        *self.pulled.entry(kind).or_default() += 1;
    }

    /// Collect a per-record failure.
    pub fn record_error(&mut self, kind: EntityKind, id: &RecordId, error: impl std::fmt::Display) {
        self.errors.push(format!("{kind} {id}: {error}"));
        self.success = false;
    }

    pub fn total_pushed(&self) -> u64 {
        self.pushed.values().sum()
    }

    pub fn total_pulled(&self) -> u64 {
        self.pulled.values().sum()
    }

    /// True when the pass moved nothing in either direction.
    pub fn is_noop(&self) -> bool {
        self.total_pushed() == 0 && self.total_pulled() == 0 && self.conflicts.is_empty()
    }
}
