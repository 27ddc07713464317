//! Sync engine: conflict resolution, reconciliation passes and scheduling

mod conflict;
mod metadata;
mod orchestrator;
mod report;
mod retry;
mod scheduler;
mod watcher;

#[cfg(test)]
mod scenarios;

pub use conflict::{resolve_conflict, ConflictDecision, LOCAL_NEWER, REMOTE_NEWER, TIMESTAMP_TIE};
pub use metadata::{ConflictLog, SyncMetadata, SyncMetadataTracker};
pub use orchestrator::{PassMode, SyncOrchestrator, SyncPhase, SyncStatus};
pub use report::SyncReport;
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, SchedulerHandle, SyncEvent, SyncRunner, SyncScheduler};
pub use watcher::NetworkWatcher;
