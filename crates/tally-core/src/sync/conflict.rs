//! Last-writer-wins conflict resolution

use serde::Serialize;

use crate::models::{Record, Resolution};

pub const LOCAL_NEWER: &str = "local timestamp newer";
pub const REMOTE_NEWER: &str = "remote timestamp newer";
pub const TIMESTAMP_TIE: &str = "timestamp tie — remote wins";

/// Which revision survives, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConflictDecision {
    pub resolution: Resolution,
    pub reason: &'static str,
}

/// Compare two revisions of the same entity.
///
/// The strictly newer `updated_at` wins. An exact tie goes to the remote
/// revision; there is no secondary tiebreaker.
pub const fn resolve_conflict(local: &Record, remote: &Record) -> ConflictDecision {
    if local.updated_at > remote.updated_at {
        ConflictDecision {
            resolution: Resolution::LocalWins,
            reason: LOCAL_NEWER,
        }
    } else if remote.updated_at > local.updated_at {
        ConflictDecision {
            resolution: Resolution::RemoteWins,
            reason: REMOTE_NEWER,
        }
    } else {
        ConflictDecision {
            resolution: Resolution::RemoteWins,
            reason: TIMESTAMP_TIE,
        }
    }
}
