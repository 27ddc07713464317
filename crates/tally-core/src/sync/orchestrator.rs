//! Two-phase reconciliation pass: push dirty records, then pull remote changes

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::conflict::resolve_conflict;
use super::metadata::{ConflictLog, SyncMetadata, SyncMetadataTracker};
use super::report::SyncReport;
use crate::error::{Error, Result};
use crate::executor::QueryExecutor;
use crate::models::{ConflictEntry, EntityKind, Record, RecordId, Resolution, SyncConflict};
use crate::store::{LocalStore, PutOutcome, RemoteStore, StatementBackend};
use crate::util::unix_millis_now;

/// Re-reads allowed when the local row keeps changing under a pull.
const RECONCILE_ATTEMPTS: usize = 3;

/// Where the orchestrator is in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SyncPhase {
    Idle = 0,
    PushPhase = 1,
    PullPhase = 2,
    Failed = 3,
}

impl SyncPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::PushPhase,
            2 => Self::PullPhase,
            3 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Which remote changes a pass pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// Changes since the stored watermark
    Incremental,
    /// Every remote record, from the epoch
    Full,
}

/// Snapshot of sync bookkeeping for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub metadata: SyncMetadata,
    /// Live count of unsynced records
    pub pending_changes: u64,
}

struct Inner<R> {
    local: LocalStore,
    remote: RemoteStore<R>,
    metadata: SyncMetadataTracker<QueryExecutor>,
    conflicts: ConflictLog<QueryExecutor>,
    phase: AtomicU8,
}

/// Drives reconciliation passes between the local and remote stores.
///
/// Only one pass runs at a time; a second caller gets
/// [`Error::SyncAlreadyInProgress`] immediately.
pub struct SyncOrchestrator<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for SyncOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> fmt::Debug for SyncOrchestrator<R> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncOrchestrator")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Holds the phase for the duration of a pass.
///
/// On drop the phase returns to idle unless the pass ended in `Failed`, which
/// stays visible until the next pass starts.
struct PassGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> PassGuard<'a> {
    fn acquire(phase: &'a AtomicU8) -> Result<Self> {
        phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match SyncPhase::from_u8(current) {
                    SyncPhase::Idle | SyncPhase::Failed => Some(SyncPhase::PushPhase as u8),
                    SyncPhase::PushPhase | SyncPhase::PullPhase => None,
                }
            })
            .map_err(|_| Error::SyncAlreadyInProgress)?;
        Ok(Self { phase })
    }

    fn enter(&self, next: SyncPhase) {
        self.phase.store(next as u8, Ordering::Release);
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if SyncPhase::from_u8(self.phase.load(Ordering::Acquire)) != SyncPhase::Failed {
            self.phase.store(SyncPhase::Idle as u8, Ordering::Release);
        }
    }
}

impl<R> SyncOrchestrator<R> {
    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// True when no pass is running.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase(), SyncPhase::Idle | SyncPhase::Failed)
    }
}

impl<R: StatementBackend> SyncOrchestrator<R> {
    pub fn new(local: LocalStore, remote: RemoteStore<R>) -> Self {
        let executor = local.backend().clone();
        Self {
            inner: Arc::new(Inner {
                metadata: SyncMetadataTracker::new(executor.clone()),
                conflicts: ConflictLog::new(executor),
                local,
                remote,
                phase: AtomicU8::new(SyncPhase::Idle as u8),
            }),
        }
    }

    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    pub fn remote(&self) -> &RemoteStore<R> {
        &self.inner.remote
    }

    pub async fn is_remote_available(&self) -> bool {
        self.inner.remote.is_available().await
    }

    /// Incremental pass from the stored watermark.
    pub async fn run_full_sync(&self) -> Result<SyncReport> {
        self.run_pass(PassMode::Incremental).await
    }

    /// Pass that pulls every remote record regardless of the watermark.
    pub async fn run_full_reconciliation(&self) -> Result<SyncReport> {
        self.run_pass(PassMode::Full).await
    }

    /// Run one guarded pass.
    ///
    /// Per-record failures are collected in the report. `Err` is returned
    /// only when the pass could not start or its bookkeeping failed.
    pub async fn run_pass(&self, mode: PassMode) -> Result<SyncReport> {
        let guard = PassGuard::acquire(&self.inner.phase)?;

        if !self.inner.remote.is_available().await {
            tracing::info!("Remote store unavailable, skipping sync pass");
            return Err(Error::RemoteUnavailable(
                "remote store is not reachable".into(),
            ));
        }

        let result = self.execute_pass(&guard, mode).await;
        match &result {
            Ok(report) => {
                if !report.success {
                    guard.enter(SyncPhase::Failed);
                }
                tracing::info!(
                    ?mode,
                    success = report.success,
                    pushed = report.total_pushed(),
                    pulled = report.total_pulled(),
                    conflicts = report.conflicts.len(),
                    errors = report.errors.len(),
                    "Sync pass finished"
                );
            }
            Err(error) => {
                guard.enter(SyncPhase::Failed);
                tracing::error!(?mode, %error, "Sync pass failed");
            }
        }
        result
    }

    async fn execute_pass(&self, guard: &PassGuard<'_>, mode: PassMode) -> Result<SyncReport> {
        let started_at = unix_millis_now();
        let mut metadata = self.inner.metadata.load().await?;
        let mut report = SyncReport::new();

        let superseded = self.push_phase(&mut report).await;

        guard.enter(SyncPhase::PullPhase);
        let since = match mode {
            PassMode::Incremental => metadata.last_sync_timestamp,
            PassMode::Full => i64::MIN,
        };
        // taken before reading so anything accepted mid-pull is pulled again next time
        let cursor = match self.inner.remote.change_cursor().await {
            Ok(cursor) => Some(cursor),
            Err(error) => {
                tracing::warn!(%error, "Could not read the remote change cursor");
                report.errors.push(format!("change cursor: {error}"));
                report.success = false;
                None
            }
        };
        let clean = self.pull_phase(since, &superseded, &mut report).await;

        if let (true, Some(cursor)) = (clean, cursor) {
            metadata.last_sync_timestamp = metadata.last_sync_timestamp.max(cursor);
            if mode == PassMode::Full {
                metadata.last_full_sync_timestamp = started_at;
            }
        }
        match self.inner.local.count_all_unsynced().await {
            Ok(pending) => metadata.pending_changes = pending,
            Err(error) => tracing::warn!(%error, "Could not count pending changes"),
        }
        self.inner.metadata.save(&metadata).await?;

        Ok(report)
    }

    /// Push every dirty record. Returns revisions the remote refused because it
    /// already holds one at least as new.
    async fn push_phase(&self, report: &mut SyncReport) -> Vec<(EntityKind, RecordId)> {
        let mut superseded = Vec::new();

        for kind in EntityKind::ALL {
            let dirty = match self.inner.local.get_unsynced(kind).await {
                Ok(dirty) => dirty,
                Err(error) => {
                    tracing::warn!(%kind, %error, "Could not read unsynced records");
                    report.errors.push(format!("{kind}: {error}"));
                    report.success = false;
                    continue;
                }
            };

            for record in dirty {
                match self.inner.remote.put_version(&record).await {
                    Ok(PutOutcome::Applied) => match self.inner.local.mark_revision_synced(&record).await {
                        Ok(marked) => {
                            if !marked {
                                tracing::debug!(%kind, id = %record.id, "Record changed during push; left dirty");
                            }
                            report.count_pushed(kind);
                        }
                        Err(error) => report.record_error(kind, &record.id, error),
                    },
                    Ok(PutOutcome::Superseded) => {
                        tracing::debug!(%kind, id = %record.id, "Remote holds a newer revision");
                        superseded.push((kind, record.id));
                    }
                    Err(error) => {
                        tracing::warn!(%kind, id = %record.id, %error, "Push failed");
                        report.record_error(kind, &record.id, error);
                    }
                }
            }
        }

        superseded
    }

    /// Pull and apply remote changes. Returns true when every read and apply
    /// succeeded.
    async fn pull_phase(
        &self,
        since: i64,
        superseded: &[(EntityKind, RecordId)],
        report: &mut SyncReport,
    ) -> bool {
        let mut clean = true;

        for kind in EntityKind::ALL {
            let changed = match self.inner.remote.get_changed_since(kind, since).await {
                Ok(changed) => changed,
                Err(error) => {
                    tracing::warn!(%kind, %error, "Could not pull remote changes");
                    report.errors.push(format!("{kind}: {error}"));
                    report.success = false;
                    clean = false;
                    continue;
                }
            };

            let mut seen = HashSet::with_capacity(changed.len());
            for remote in changed {
                seen.insert(remote.id);
                if let Err(error) = self.reconcile(&remote, report).await {
                    report.record_error(kind, &remote.id, error);
                    clean = false;
                }
            }

            for (_, id) in superseded
                .iter()
                .filter(|(superseded_kind, id)| *superseded_kind == kind && !seen.contains(id))
            {
                let outcome = match self.inner.remote.get(kind, id).await {
                    Ok(Some(remote)) => self.reconcile(&remote, report).await,
                    Ok(None) => Err(Error::NotFound(format!("{kind} {id} on remote"))),
                    Err(error) => Err(error),
                };
                if let Err(error) = outcome {
                    report.record_error(kind, id, error);
                }
            }
        }

        clean
    }

    /// Apply one remote revision to the local store, re-reading the local row
    /// when it changes between the decision and the write.
    async fn reconcile(&self, remote: &Record, report: &mut SyncReport) -> Result<()> {
        for attempt in 1..=RECONCILE_ATTEMPTS {
            if self.try_reconcile(remote, report).await? {
                return Ok(());
            }
            tracing::debug!(
                kind = %remote.kind,
                id = %remote.id,
                attempt,
                "Local record changed during pull; re-reading"
            );
        }
        Err(Error::Database(format!(
            "{} {} kept changing locally during pull",
            remote.kind, remote.id
        )))
    }

    /// One read-decide-write round. Returns false when the guarded write found
    /// a different local revision than the one decided against.
    async fn try_reconcile(&self, remote: &Record, report: &mut SyncReport) -> Result<bool> {
        let local = self.inner.local.get(remote.kind, &remote.id).await?;

        match local {
            None => {
                if !self.inner.local.apply_remote_over(remote, None).await? {
                    return Ok(false);
                }
                report.count_pulled(remote.kind);
            }
            Some(local) if local.synced => {
                if local.same_revision(remote) {
                    return Ok(true);
                }
                if !self.inner.local.apply_remote_over(remote, Some(&local)).await? {
                    return Ok(false);
                }
                report.count_pulled(remote.kind);
            }
            Some(local) => {
                let decision = resolve_conflict(&local, remote);
                if decision.resolution == Resolution::RemoteWins {
                    if !self.inner.local.apply_remote_over(remote, Some(&local)).await? {
                        return Ok(false);
                    }
                    report.count_pulled(remote.kind);
                }
                tracing::info!(
                    kind = %remote.kind,
                    id = %remote.id,
                    local_updated_at = local.updated_at,
                    remote_updated_at = remote.updated_at,
                    resolution = decision.resolution.as_str(),
                    "Resolved sync conflict"
                );

                if let Err(error) = self
                    .inner
                    .conflicts
                    .record(
                        remote.kind,
                        &remote.id.as_str(),
                        local.updated_at,
                        remote.updated_at,
                        decision.resolution,
                        decision.reason,
                    )
                    .await
                {
                    tracing::warn!(%error, "Could not persist conflict log entry");
                }
                report.conflicts.push(ConflictEntry {
                    kind: remote.kind,
                    id: remote.id,
                    resolution: decision.resolution,
                    reason: decision.reason.to_string(),
                });
            }
        }
        Ok(true)
    }

    /// Whether `interval` has passed since the last full reconciliation.
    /// A device that never ran one is due.
    pub async fn full_pass_due(&self, interval: Duration) -> bool {
        match self.inner.metadata.load().await {
            Ok(metadata) => {
                let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
                unix_millis_now().saturating_sub(metadata.last_full_sync_timestamp) >= interval_ms
            }
            Err(error) => {
                tracing::warn!(%error, "Could not read sync metadata");
                false
            }
        }
    }

    /// Current phase, metadata and live pending count.
    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            phase: self.phase(),
            metadata: self.inner.metadata.load().await?,
            pending_changes: self.inner.local.count_all_unsynced().await?,
        })
    }

    /// Recently resolved conflicts, newest first.
    pub async fn conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.inner.conflicts.list(limit).await
    }
}
