//! Persisted sync bookkeeping: watermarks and the conflict log

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::executor::{Row, SYNC_CONFLICTS_TABLE, SYNC_METADATA_TABLE};
use crate::models::{EntityKind, Resolution, SyncConflict};
use crate::store::{apply_write, fetch_rows, StatementBackend};
use crate::util::unix_millis_now;

/// Singleton sync metadata row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Watermark of the last completed incremental pass (Unix ms)
    pub last_sync_timestamp: i64,
    /// Start of the last completed full reconciliation (Unix ms)
    pub last_full_sync_timestamp: i64,
    /// Unsynced records after the last pass; advisory only
    pub pending_changes: u64,
}

/// Reads and writes the [`SyncMetadata`] row in the local database.
#[derive(Debug, Clone)]
pub struct SyncMetadataTracker<B> {
    backend: B,
}

impl<B: StatementBackend> SyncMetadataTracker<B> {
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Current metadata; all zeros before the first pass.
    pub async fn load(&self) -> Result<SyncMetadata> {
        let rows = fetch_rows(
            &self.backend,
            format!(
                "SELECT last_sync_timestamp, last_full_sync_timestamp, pending_changes FROM {SYNC_METADATA_TABLE} WHERE id = 1"
            ),
            Vec::new(),
        )
        .await?;

        Ok(rows.first().map_or_else(SyncMetadata::default, |row| SyncMetadata {
            last_sync_timestamp: int_column(row, "last_sync_timestamp"),
            last_full_sync_timestamp: int_column(row, "last_full_sync_timestamp"),
            pending_changes: u64::try_from(int_column(row, "pending_changes")).unwrap_or_default(),
        }))
    }

    pub async fn save(&self, metadata: &SyncMetadata) -> Result<()> {
        apply_write(
            &self.backend,
            format!(
                "INSERT INTO {SYNC_METADATA_TABLE} (id, last_sync_timestamp, last_full_sync_timestamp, pending_changes) \
                 VALUES (1, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET last_sync_timestamp = excluded.last_sync_timestamp, \
                 last_full_sync_timestamp = excluded.last_full_sync_timestamp, \
                 pending_changes = excluded.pending_changes"
            ),
            vec![
                json!(metadata.last_sync_timestamp),
                json!(metadata.last_full_sync_timestamp),
                json!(metadata.pending_changes),
            ],
        )
        .await?;
        Ok(())
    }
}

/// Append-only log of resolved conflicts.
#[derive(Debug, Clone)]
pub struct ConflictLog<B> {
    backend: B,
}

impl<B: StatementBackend> ConflictLog<B> {
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Persist one resolved conflict.
    pub async fn record(
        &self,
        kind: EntityKind,
        record_id: &str,
        local_updated_at: i64,
        remote_updated_at: i64,
        resolution: Resolution,
        reason: &str,
    ) -> Result<()> {
        apply_write(
            &self.backend,
            format!(
                "INSERT INTO {SYNC_CONFLICTS_TABLE} (kind, record_id, local_updated_at, remote_updated_at, resolved_at, resolution, reason) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
            ),
            vec![
                json!(kind.label()),
                json!(record_id),
                json!(local_updated_at),
                json!(remote_updated_at),
                json!(unix_millis_now()),
                json!(resolution.as_str()),
                json!(reason),
            ],
        )
        .await?;
        Ok(())
    }

    /// Most recently resolved conflicts first.
    pub async fn list(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let rows = fetch_rows(
            &self.backend,
            format!(
                "SELECT id, kind, record_id, local_updated_at, remote_updated_at, resolved_at, resolution, reason \
                 FROM {SYNC_CONFLICTS_TABLE} ORDER BY resolved_at DESC, id DESC LIMIT ?"
            ),
            vec![json!(limit as i64)],
        )
        .await?;

        rows.iter().map(parse_conflict).collect()
    }
}

fn int_column(row: &Row, name: &str) -> i64 {
    row.get(name).and_then(Value::as_i64).unwrap_or_default()
}

fn text_column<'a>(row: &'a Row, name: &str) -> Result<&'a str> {
    row.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Database(format!("conflict row missing {name}")))
}

fn parse_conflict(row: &Row) -> Result<SyncConflict> {
    let resolution = text_column(row, "resolution")?;
    Ok(SyncConflict {
        id: int_column(row, "id"),
        kind: text_column(row, "kind")?.parse()?,
        record_id: text_column(row, "record_id")?.to_string(),
        local_updated_at: int_column(row, "local_updated_at"),
        remote_updated_at: int_column(row, "remote_updated_at"),
        resolved_at: int_column(row, "resolved_at"),
        resolution: Resolution::parse(resolution)
            .ok_or_else(|| Error::Database(format!("unknown resolution {resolution}")))?,
        reason: text_column(row, "reason")?.to_string(),
    })
}
