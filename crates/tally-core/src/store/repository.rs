//! Generic entity repository over a statement backend

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{json, Value};

use super::backend::{apply_write, apply_write_batch, fetch_rows, StatementBackend};
use super::statements::{change_cursor, StatementSet};
use crate::error::{Error, Result};
use crate::executor::{QueryExecutor, Row, SchemaFlavor, Statement};
use crate::models::{merge_patch, EntityKind, EntityModel, Record, RecordId};
use crate::util::MonotonicClock;

/// Marker for which side of the sync boundary a store serves.
pub trait StoreFlavor: Send + Sync + 'static {
    const SCHEMA: SchemaFlavor;
}

/// Device-resident store with dirty tracking
#[derive(Debug, Clone, Copy)]
pub struct Local;

/// Authoritative store; every revision it holds is synced by definition
#[derive(Debug, Clone, Copy)]
pub struct Remote;

impl StoreFlavor for Local {
    const SCHEMA: SchemaFlavor = SchemaFlavor::Local;
}

impl StoreFlavor for Remote {
    const SCHEMA: SchemaFlavor = SchemaFlavor::Remote;
}

/// Result of offering a revision to the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored as the current revision
    Applied,
    /// The stored revision is as new or newer; nothing changed
    Superseded,
}

/// A write built against a store but not yet sent, with the record it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub record: Record,
    statement: Statement,
}

/// CRUD over every entity kind, parameterized by transport and flavor.
pub struct EntityStore<B, F> {
    backend: B,
    clock: Arc<MonotonicClock>,
    _flavor: PhantomData<fn() -> F>,
}

pub type LocalStore = EntityStore<QueryExecutor, Local>;
pub type RemoteStore<B> = EntityStore<B, Remote>;

impl<B: Clone, F> Clone for EntityStore<B, F> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            clock: Arc::clone(&self.clock),
            _flavor: PhantomData,
        }
    }
}

impl<B: fmt::Debug, F: StoreFlavor> fmt::Debug for EntityStore<B, F> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EntityStore")
            .field("flavor", &F::SCHEMA)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl<B: StatementBackend, F: StoreFlavor> EntityStore<B, F> {
    pub fn new(backend: B) -> Self {
        Self::with_clock(backend, Arc::new(MonotonicClock::new()))
    }

    pub const fn with_clock(backend: B, clock: Arc<MonotonicClock>) -> Self {
        Self {
            backend,
            clock,
            _flavor: PhantomData,
        }
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }

    const fn statements(kind: EntityKind) -> StatementSet {
        StatementSet::new(kind, F::SCHEMA)
    }

    async fn read(&self, sql: String, params: Vec<Value>) -> Result<Vec<Row>> {
        fetch_rows(&self.backend, sql, params).await
    }

    async fn write(&self, sql: String, params: Vec<Value>) -> Result<u64> {
        apply_write(&self.backend, sql, params).await
    }

    async fn read_records(&self, kind: EntityKind, sql: String, params: Vec<Value>) -> Result<Vec<Record>> {
        self.read(sql, params)
            .await?
            .iter()
            .map(|row| record_from_row(kind, F::SCHEMA, row))
            .collect()
    }

    async fn count_with(&self, sql: String) -> Result<u64> {
        let rows = self.read(sql, Vec::new()).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Ok(count)
    }

    /// Create a record with a fresh id and timestamp.
    pub async fn insert(&self, kind: EntityKind, payload: Value) -> Result<Record> {
        let staged = self.stage_insert(kind, payload)?;
        self.write(staged.statement.sql, staged.statement.params)
            .await?;

        tracing::debug!(%kind, id = %staged.record.id, "Inserted record");
        Ok(staged.record)
    }

    /// Build the insert for a new record without sending it.
    pub fn stage_insert(&self, kind: EntityKind, payload: Value) -> Result<StagedWrite> {
        if !payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "{kind} payload must be a JSON object"
            )));
        }

        let record = Record {
            kind,
            id: RecordId::new(),
            payload,
            updated_at: self.clock.now_millis(),
            deleted_at: None,
            synced: !F::SCHEMA.tracks_sync(),
        };
        let statement =
            Statement::with_params(Self::statements(kind).insert(), revision_params(&record));
        Ok(StagedWrite { record, statement })
    }

    pub fn stage_insert_model<M: EntityModel>(&self, model: &M) -> Result<StagedWrite> {
        self.stage_insert(M::KIND, model.to_payload()?)
    }

    /// Build a merge-patch update of `record` without sending it.
    pub fn stage_update(&self, mut record: Record, patch: &Value) -> Result<StagedWrite> {
        if record.is_deleted() {
            return Err(Error::NotFound(format!("{} {}", record.kind, record.id)));
        }
        merge_patch(&mut record.payload, patch);
        if !record.payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "{} payload must remain a JSON object",
                record.kind
            )));
        }
        Ok(self.stage_rewrite(record, false))
    }

    /// Send staged writes as one all-or-nothing batch.
    pub async fn commit(&self, writes: Vec<StagedWrite>) -> Result<Vec<Record>> {
        let (records, statements): (Vec<_>, Vec<_>) = writes
            .into_iter()
            .map(|staged| (staged.record, staged.statement))
            .unzip();
        let changes = apply_write_batch(&self.backend, statements).await?;
        if changes.iter().any(|changed| *changed == 0) {
            tracing::warn!(?changes, "Committed write batch with statements that matched no row");
        }
        tracing::debug!(writes = changes.len(), "Committed write batch");
        Ok(records)
    }

    /// Fetch a record, including tombstones.
    pub async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Record>> {
        let mut records = self
            .read_records(
                kind,
                Self::statements(kind).select_by_id(),
                vec![json!(id.as_str())],
            )
            .await?;
        Ok(records.pop())
    }

    /// Live records, most recently written first.
    pub async fn list(&self, kind: EntityKind, limit: usize, offset: usize) -> Result<Vec<Record>> {
        self.read_records(
            kind,
            Self::statements(kind).list_live(),
            vec![json!(limit as i64), json!(offset as i64)],
        )
        .await
    }

    /// Number of live records.
    pub async fn count(&self, kind: EntityKind) -> Result<u64> {
        self.count_with(Self::statements(kind).count_live()).await
    }

    /// Merge `patch` into the payload and stamp a new revision.
    pub async fn update(&self, kind: EntityKind, id: &RecordId, patch: &Value) -> Result<Record> {
        let record = self.live_record(kind, id).await?;
        let staged = self.stage_update(record, patch)?;
        self.send_rewrite(staged).await
    }

    /// Tombstone a record. The row itself is kept.
    pub async fn soft_delete(&self, kind: EntityKind, id: &RecordId) -> Result<Record> {
        let record = self.live_record(kind, id).await?;
        self.send_rewrite(self.stage_rewrite(record, true)).await
    }

    async fn live_record(&self, kind: EntityKind, id: &RecordId) -> Result<Record> {
        match self.get(kind, id).await? {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(Error::NotFound(format!("{kind} {id}"))),
        }
    }

    fn stage_rewrite(&self, mut record: Record, tombstone: bool) -> StagedWrite {
        record.updated_at = self.clock.next_after(record.updated_at.saturating_add(1));
        if tombstone {
            record.deleted_at = Some(record.updated_at);
        }
        record.synced = !F::SCHEMA.tracks_sync();

        let params = vec![
            Value::String(record.payload.to_string()),
            json!(record.updated_at),
            json!(record.deleted_at),
            json!(record.id.as_str()),
        ];
        let statement =
            Statement::with_params(Self::statements(record.kind).update_revision(), params);
        StagedWrite { record, statement }
    }

    async fn send_rewrite(&self, staged: StagedWrite) -> Result<Record> {
        let StagedWrite { record, statement } = staged;
        let changes = self.write(statement.sql, statement.params).await?;
        if changes == 0 {
            return Err(Error::NotFound(format!("{} {}", record.kind, record.id)));
        }

        tracing::debug!(kind = %record.kind, id = %record.id, updated_at = record.updated_at, "Rewrote record");
        Ok(record)
    }

    /// Insert a typed model.
    pub async fn insert_model<M: EntityModel>(&self, model: &M) -> Result<Record> {
        self.insert(M::KIND, model.to_payload()?).await
    }

    /// Fetch a live record as a typed model.
    pub async fn get_model<M: EntityModel>(&self, id: &RecordId) -> Result<Option<M>> {
        match self.get(M::KIND, id).await? {
            Some(record) if !record.is_deleted() => Ok(Some(M::from_payload(&record.payload)?)),
            _ => Ok(None),
        }
    }

    /// Live records of a typed model, most recent first.
    pub async fn list_models<M: EntityModel>(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(RecordId, M)>> {
        self.list(M::KIND, limit, offset)
            .await?
            .into_iter()
            .map(|record| Ok((record.id, M::from_payload(&record.payload)?)))
            .collect()
    }
}

impl<B: StatementBackend> EntityStore<B, Local> {
    /// Every record whose current revision the remote has not accepted.
    pub async fn get_unsynced(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.read_records(kind, Self::statements(kind).select_unsynced(), Vec::new())
            .await
    }

    pub async fn count_unsynced(&self, kind: EntityKind) -> Result<u64> {
        self.count_with(Self::statements(kind).count_unsynced()).await
    }

    /// Unsynced records across all kinds.
    pub async fn count_all_unsynced(&self) -> Result<u64> {
        let mut total = 0;
        for kind in EntityKind::ALL {
            total += self.count_unsynced(kind).await?;
        }
        Ok(total)
    }

    /// Mark a record synced. Leaves `updated_at` alone; repeat calls are no-ops.
    pub async fn mark_synced(&self, kind: EntityKind, id: &RecordId) -> Result<()> {
        let changes = self
            .write(Self::statements(kind).mark_synced(), vec![json!(id.as_str())])
            .await?;
        if changes == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    /// Mark exactly this revision synced. Returns false when the record was
    /// rewritten after `record` was read, leaving the newer revision dirty.
    pub async fn mark_revision_synced(&self, record: &Record) -> Result<bool> {
        let changes = self
            .write(
                Self::statements(record.kind).mark_revision_synced(),
                vec![json!(record.id.as_str()), json!(record.updated_at)],
            )
            .await?;
        Ok(changes > 0)
    }

    /// Store a remote revision verbatim, keeping its timestamp, as synced.
    ///
    /// `expected` is the local row the caller decided against, or `None` when
    /// there was none. Returns false without writing when the row no longer
    /// matches it, so a local edit made in between is never overwritten.
    pub async fn apply_remote_over(&self, remote: &Record, expected: Option<&Record>) -> Result<bool> {
        let statements = Self::statements(remote.kind);
        let changes = match expected {
            None => {
                self.write(statements.insert_synced_if_absent(), revision_params(remote))
                    .await?
            }
            Some(local) => {
                let params = vec![
                    Value::String(remote.payload.to_string()),
                    json!(remote.updated_at),
                    json!(remote.deleted_at),
                    json!(remote.id.as_str()),
                    json!(local.updated_at),
                    json!(i64::from(local.synced)),
                ];
                self.write(statements.replace_revision_synced(), params).await?
            }
        };
        if changes > 0 {
            tracing::debug!(kind = %remote.kind, id = %remote.id, "Applied remote revision");
        }
        Ok(changes > 0)
    }
}

impl<B: StatementBackend> EntityStore<B, Remote> {
    /// Live and tombstoned records the remote accepted after change stamp
    /// `since`, in acceptance order.
    ///
    /// Stamps come from the remote's own clock, so a revision pushed late with
    /// an old `updated_at` still shows up after every cursor taken before it.
    pub async fn get_changed_since(&self, kind: EntityKind, since: i64) -> Result<Vec<Record>> {
        self.read_records(
            kind,
            Self::statements(kind).select_changed_since(),
            vec![json!(since)],
        )
        .await
    }

    /// Newest change stamp the remote has handed out; 0 for an empty store.
    pub async fn change_cursor(&self) -> Result<i64> {
        let rows = self.read(change_cursor(), Vec::new()).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(Value::as_i64)
            .unwrap_or_default())
    }

    /// Offer a revision, keeping its timestamp. Older or equal revisions never
    /// replace a stored one.
    pub async fn put_version(&self, record: &Record) -> Result<PutOutcome> {
        let changes = self
            .write(
                Self::statements(record.kind).upsert_if_newer(),
                revision_params(record),
            )
            .await?;
        Ok(if changes > 0 {
            PutOutcome::Applied
        } else {
            PutOutcome::Superseded
        })
    }
}

fn revision_params(record: &Record) -> Vec<Value> {
    vec![
        json!(record.id.as_str()),
        Value::String(record.payload.to_string()),
        json!(record.updated_at),
        json!(record.deleted_at),
    ]
}

fn record_from_row(kind: EntityKind, flavor: SchemaFlavor, row: &Row) -> Result<Record> {
    let column = |name: &str| {
        row.get(name)
            .ok_or_else(|| Error::Database(format!("{} row missing column {name}", kind.table())))
    };

    let id = column("id")?
        .as_str()
        .ok_or_else(|| Error::Database("record id is not text".into()))?
        .parse::<RecordId>()
        .map_err(|error| Error::InvalidInput(format!("invalid record id: {error}")))?;
    let payload = match column("payload")? {
        Value::String(text) => serde_json::from_str(text)?,
        other => other.clone(),
    };
    let updated_at = column("updated_at")?
        .as_i64()
        .ok_or_else(|| Error::Database(format!("{kind} {id} has no updated_at")))?;
    let deleted_at = column("deleted_at")?.as_i64();
    let synced = if flavor.tracks_sync() {
        column("synced")?.as_i64() == Some(1)
    } else {
        true
    };

    Ok(Record {
        kind,
        id,
        payload,
        updated_at,
        deleted_at,
        synced,
    })
}
