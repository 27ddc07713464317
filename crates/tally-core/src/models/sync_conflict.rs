//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::{EntityKind, RecordId};

/// Which side of a conflict survived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local_wins" => Some(Self::LocalWins),
            "remote_wins" => Some(Self::RemoteWins),
            _ => None,
        }
    }
}

/// Conflict resolved during one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub kind: EntityKind,
    pub id: RecordId,
    pub resolution: Resolution,
    pub reason: String,
}

/// Recorded sync conflict as persisted in the conflict log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub kind: EntityKind,
    /// Record involved in the conflict
    pub record_id: String,
    /// Local revision's timestamp when the conflict occurred
    pub local_updated_at: i64,
    /// Remote revision's timestamp
    pub remote_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    pub resolution: Resolution,
    pub reason: String,
}
