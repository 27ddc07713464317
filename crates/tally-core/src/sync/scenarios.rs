//! End-to-end reconciliation scenarios between devices sharing one remote

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::{SyncOrchestrator, LOCAL_NEWER, REMOTE_NEWER, TIMESTAMP_TIE};
use crate::error::{Error, Result};
use crate::executor::{Outcome, QueryExecutor, RequestKind, RequestPayload, SchemaFlavor};
use crate::models::{EntityKind, Product, RecordId, Resolution};
use crate::store::{LocalStore, RemoteStore, StatementBackend};

async fn remote_executor() -> QueryExecutor {
    QueryExecutor::in_memory(SchemaFlavor::Remote).await.unwrap()
}

async fn device<R: StatementBackend>(remote: R) -> (LocalStore, SyncOrchestrator<R>) {
    let local = LocalStore::new(QueryExecutor::in_memory(SchemaFlavor::Local).await.unwrap());
    let orchestrator = SyncOrchestrator::new(local.clone(), RemoteStore::new(remote));
    (local, orchestrator)
}

async fn stamp(local: &LocalStore, id: &RecordId, updated_at: i64) {
    local
        .backend()
        .execute(
            "UPDATE products SET updated_at = ? WHERE id = ?",
            vec![json!(updated_at), json!(id.as_str())],
        )
        .await
        .unwrap();
}

async fn price(local: &LocalStore, id: &RecordId) -> i64 {
    local.get_model::<Product>(id).await.unwrap().unwrap().price_cents
}

/// Remote whose reachability can be flipped.
struct Switch {
    inner: QueryExecutor,
    online: AtomicBool,
}

impl StatementBackend for Switch {
    async fn dispatch(&self, kind: RequestKind, payload: RequestPayload) -> Result<Outcome> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable("offline".into()));
        }
        self.inner.dispatch(kind, payload).await
    }

    async fn is_available(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Remote that fails writes touching any blocked record id.
struct Blocking {
    inner: QueryExecutor,
    blocked: Mutex<HashSet<String>>,
}

impl Blocking {
    fn new(inner: QueryExecutor) -> Self {
        Self {
            inner,
            blocked: Mutex::new(HashSet::new()),
        }
    }

    fn block(&self, id: &RecordId) {
        self.blocked.lock().unwrap().insert(id.as_str());
    }

    fn unblock_all(&self) {
        self.blocked.lock().unwrap().clear();
    }

    fn touches_blocked(&self, payload: &RequestPayload) -> bool {
        let blocked = self.blocked.lock().unwrap();
        match payload {
            RequestPayload::Single(statement) => statement
                .params
                .iter()
                .any(|param| matches!(param, Value::String(text) if blocked.contains(text))),
            RequestPayload::Batch(_) => false,
        }
    }
}

impl StatementBackend for Blocking {
    async fn dispatch(&self, kind: RequestKind, payload: RequestPayload) -> Result<Outcome> {
        if kind == RequestKind::Write && self.touches_blocked(&payload) {
            return Err(Error::Remote("connection reset".into()));
        }
        self.inner.dispatch(kind, payload).await
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn second_pass_without_changes_is_a_noop() {
    let remote = remote_executor().await;
    let (local, orchestrator) = device(remote.clone()).await;
    local.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    local.insert_model(&Product::new("Scone", 300, 6)).await.unwrap();

    let first = orchestrator.run_full_sync().await.unwrap();
    assert_eq!(first.total_pushed(), 2);
    let watermark = orchestrator.status().await.unwrap().metadata.last_sync_timestamp;

    let second = orchestrator.run_full_sync().await.unwrap();
    assert!(second.is_noop());
    assert!(second.success);
    assert_eq!(
        orchestrator.status().await.unwrap().metadata.last_sync_timestamp,
        watermark
    );
    assert_eq!(RemoteStore::new(remote).count(EntityKind::Product).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_writes_are_pushed_after_reconnect() {
    let switch = Arc::new(Switch {
        inner: remote_executor().await,
        online: AtomicBool::new(false),
    });
    let (local, orchestrator) = device(Arc::clone(&switch)).await;

    for name in ["Tea", "Scone", "Muffin"] {
        local.insert_model(&Product::new(name, 100, 1)).await.unwrap();
    }
    assert!(matches!(
        orchestrator.run_full_sync().await,
        Err(Error::RemoteUnavailable(_))
    ));
    assert_eq!(local.count_all_unsynced().await.unwrap(), 3);

    switch.online.store(true, Ordering::SeqCst);
    let report = orchestrator.run_full_sync().await.unwrap();
    assert!(report.success);
    assert_eq!(report.pushed[&EntityKind::Product], 3);
    assert_eq!(local.count_all_unsynced().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_remote_edit_wins_over_older_local_edit() {
    let remote = remote_executor().await;
    let (local_a, sync_a) = device(remote.clone()).await;
    let (local_b, sync_b) = device(remote.clone()).await;

    let record = local_a.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    sync_a.run_full_sync().await.unwrap();
    sync_b.run_full_sync().await.unwrap();
    let base = record.updated_at;

    local_a
        .update(EntityKind::Product, &record.id, &json!({"price_cents": 275}))
        .await
        .unwrap();
    local_b
        .update(EntityKind::Product, &record.id, &json!({"price_cents": 300}))
        .await
        .unwrap();
    stamp(&local_a, &record.id, base + 10).await;
    stamp(&local_b, &record.id, base + 20).await;

    assert!(sync_b.run_full_sync().await.unwrap().conflicts.is_empty());
    let report = sync_a.run_full_sync().await.unwrap();

    assert!(report.success);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, Resolution::RemoteWins);
    assert_eq!(report.conflicts[0].reason, REMOTE_NEWER);
    assert_eq!(price(&local_a, &record.id).await, 300);
    assert_eq!(local_a.count_all_unsynced().await.unwrap(), 0);

    let logged = sync_a.conflicts(10).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].local_updated_at, base + 10);
    assert_eq!(logged[0].remote_updated_at, base + 20);
}

#[tokio::test(flavor = "multi_thread")]
async fn timestamp_tie_goes_to_the_remote() {
    let remote = remote_executor().await;
    let (local_a, sync_a) = device(remote.clone()).await;
    let (local_b, sync_b) = device(remote.clone()).await;

    let record = local_a.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    sync_a.run_full_sync().await.unwrap();
    sync_b.run_full_sync().await.unwrap();
    let edited_at = record.updated_at + 10;

    local_a
        .update(EntityKind::Product, &record.id, &json!({"price_cents": 275}))
        .await
        .unwrap();
    local_b
        .update(EntityKind::Product, &record.id, &json!({"price_cents": 300}))
        .await
        .unwrap();
    stamp(&local_a, &record.id, edited_at).await;
    stamp(&local_b, &record.id, edited_at).await;

    sync_b.run_full_sync().await.unwrap();
    let report = sync_a.run_full_sync().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, Resolution::RemoteWins);
    assert_eq!(report.conflicts[0].reason, TIMESTAMP_TIE);
    assert_eq!(price(&local_a, &record.id).await, 300);
}

#[tokio::test(flavor = "multi_thread")]
async fn newer_local_edit_survives_a_failed_push_and_lands_later() {
    let remote = remote_executor().await;
    let blocking = Arc::new(Blocking::new(remote.clone()));
    let (local_a, sync_a) = device(Arc::clone(&blocking)).await;
    let (local_b, sync_b) = device(remote.clone()).await;

    let record = local_a.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    sync_a.run_full_sync().await.unwrap();
    sync_b.run_full_sync().await.unwrap();
    let base = record.updated_at;

    local_a
        .update(EntityKind::Product, &record.id, &json!({"price_cents": 275}))
        .await
        .unwrap();
    local_b
        .update(EntityKind::Product, &record.id, &json!({"price_cents": 300}))
        .await
        .unwrap();
    stamp(&local_a, &record.id, base + 30).await;
    stamp(&local_b, &record.id, base + 20).await;
    sync_b.run_full_sync().await.unwrap();

    blocking.block(&record.id);
    let blocked = sync_a.run_full_sync().await.unwrap();
    assert!(!blocked.success);
    assert_eq!(blocked.errors.len(), 1);
    assert_eq!(blocked.conflicts.len(), 1);
    assert_eq!(blocked.conflicts[0].resolution, Resolution::LocalWins);
    assert_eq!(blocked.conflicts[0].reason, LOCAL_NEWER);
    assert_eq!(price(&local_a, &record.id).await, 275);
    assert_eq!(local_a.count_all_unsynced().await.unwrap(), 1);

    blocking.unblock_all();
    let retried = sync_a.run_full_sync().await.unwrap();
    assert!(retried.success);
    assert_eq!(retried.pushed[&EntityKind::Product], 1);

    sync_b.run_full_sync().await.unwrap();
    assert_eq!(price(&local_b, &record.id).await, 275);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletions_propagate_as_tombstones() {
    let remote = remote_executor().await;
    let (local_a, sync_a) = device(remote.clone()).await;
    let (local_b, sync_b) = device(remote.clone()).await;

    let record = local_a.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    sync_a.run_full_sync().await.unwrap();
    sync_b.run_full_sync().await.unwrap();
    assert!(local_b.get_model::<Product>(&record.id).await.unwrap().is_some());

    local_a.soft_delete(EntityKind::Product, &record.id).await.unwrap();
    sync_a.run_full_sync().await.unwrap();
    let report = sync_b.run_full_sync().await.unwrap();

    assert_eq!(report.pulled[&EntityKind::Product], 1);
    assert!(local_b.get_model::<Product>(&record.id).await.unwrap().is_none());
    let tombstone = local_b.get(EntityKind::Product, &record.id).await.unwrap().unwrap();
    assert!(tombstone.is_deleted());
    assert!(tombstone.synced);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failing_record_does_not_abort_the_batch() {
    let remote = remote_executor().await;
    let blocking = Arc::new(Blocking::new(remote.clone()));
    let (local, orchestrator) = device(Arc::clone(&blocking)).await;

    let mut ids = Vec::new();
    for name in ["Tea", "Scone", "Muffin"] {
        ids.push(local.insert_model(&Product::new(name, 100, 1)).await.unwrap().id);
    }
    blocking.block(&ids[1]);

    let report = orchestrator.run_full_sync().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.pushed[&EntityKind::Product], 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains(&ids[1].as_str()));

    let dirty = local.get_unsynced(EntityKind::Product).await.unwrap();
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].id, ids[1]);

    blocking.unblock_all();
    let retried = orchestrator.run_full_sync().await.unwrap();
    assert!(retried.success);
    assert_eq!(retried.pushed[&EntityKind::Product], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_reconciliation_pulls_changes_behind_the_watermark() {
    let remote = remote_executor().await;
    let (local, orchestrator) = device(remote.clone()).await;
    local.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    orchestrator.run_full_sync().await.unwrap();

    let legacy = RecordId::new();
    remote
        .execute(
            "INSERT INTO products (id, payload, updated_at, deleted_at) VALUES (?, ?, ?, NULL)",
            vec![
                json!(legacy.as_str()),
                json!(r#"{"name":"Legacy","price_cents":100,"stock":1}"#),
                json!(1),
            ],
        )
        .await
        .unwrap();

    let incremental = orchestrator.run_full_sync().await.unwrap();
    assert_eq!(incremental.total_pulled(), 0);
    assert!(local.get(EntityKind::Product, &legacy).await.unwrap().is_none());

    let full = orchestrator.run_full_reconciliation().await.unwrap();
    assert_eq!(full.pulled[&EntityKind::Product], 1);
    assert!(local.get_model::<Product>(&legacy).await.unwrap().is_some());
    assert!(orchestrator.status().await.unwrap().metadata.last_full_sync_timestamp > 0);

    let again = orchestrator.run_full_reconciliation().await.unwrap();
    assert!(again.is_noop());
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_reaches_a_device_whose_watermark_passed_it() {
    let remote = remote_executor().await;
    let switch = Arc::new(Switch {
        inner: remote.clone(),
        online: AtomicBool::new(false),
    });
    let (local_a, sync_a) = device(remote.clone()).await;
    let (local_b, sync_b) = device(Arc::clone(&switch)).await;

    let offline = local_b.insert_model(&Product::new("Scone", 300, 6)).await.unwrap();
    stamp(&local_b, &offline.id, 1).await;

    local_a.insert_model(&Product::new("Tea", 250, 4)).await.unwrap();
    sync_a.run_full_sync().await.unwrap();
    let watermark = sync_a.status().await.unwrap().metadata.last_sync_timestamp;
    assert!(watermark > 1);

    switch.online.store(true, Ordering::SeqCst);
    let pushed = sync_b.run_full_sync().await.unwrap();
    assert_eq!(pushed.pushed[&EntityKind::Product], 1);

    let pulled = sync_a.run_full_sync().await.unwrap();
    assert!(pulled.success);
    assert_eq!(pulled.pulled[&EntityKind::Product], 1);
    let copy = local_a.get(EntityKind::Product, &offline.id).await.unwrap().unwrap();
    assert_eq!(copy.updated_at, 1);
    assert!(copy.synced);

    assert!(sync_a.run_full_sync().await.unwrap().is_noop());
}
