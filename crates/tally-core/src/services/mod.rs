//! Point-of-sale service used by the CLI and other callers.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::QueryExecutor;
use crate::models::{
    merge_patch, EntityKind, EntityModel, PaymentMethod, Product, Record, RecordId, Sale, SaleItem,
    SyncConflict,
};
use crate::remote::HttpRemote;
use crate::store::{LocalStore, RemoteStore, StatementBackend};
use crate::sync::{
    SchedulerConfig, SchedulerHandle, SyncOrchestrator, SyncReport, SyncScheduler, SyncStatus,
};
use crate::util::unix_millis_now;

/// One requested sale line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRequest {
    pub product_id: RecordId,
    pub quantity: i64,
}

/// A recorded sale with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaleReceipt {
    pub sale_id: RecordId,
    pub sale: Sale,
    pub items: Vec<(RecordId, SaleItem)>,
}

/// Local-first catalog and sales operations with sync attached.
///
/// Every mutation succeeds offline; when a scheduler is attached it is asked
/// for a debounced pass afterwards.
pub struct PosService<R = HttpRemote> {
    local: LocalStore,
    orchestrator: SyncOrchestrator<R>,
    scheduler: Arc<OnceLock<SchedulerHandle>>,
    debounce: Duration,
}

impl<R> Clone for PosService<R> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            orchestrator: self.orchestrator.clone(),
            scheduler: Arc::clone(&self.scheduler),
            debounce: self.debounce,
        }
    }
}

impl PosService<HttpRemote> {
    /// Boot the local executor and remote transport described by `config`.
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        if let Some(image) = config.image_store() {
            tracing::info!("Opening local store at {}", image.path().display());
        } else {
            tracing::info!("Running with an in-memory local store");
        }

        let executor = QueryExecutor::start(config.executor_config()?).await?;
        let remote = config.remote()?;
        if !remote.is_configured() {
            tracing::info!("Running in local-only mode (no remote configured)");
        }

        Ok(Self::with_stores(LocalStore::new(executor), RemoteStore::new(remote))
            .with_debounce(config.debounce))
    }
}

impl<R: StatementBackend + 'static> PosService<R> {
    pub fn with_stores(local: LocalStore, remote: RemoteStore<R>) -> Self {
        Self {
            orchestrator: SyncOrchestrator::new(local.clone(), remote),
            local,
            scheduler: Arc::new(OnceLock::new()),
            debounce: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub const fn local(&self) -> &LocalStore {
        &self.local
    }

    pub const fn orchestrator(&self) -> &SyncOrchestrator<R> {
        &self.orchestrator
    }

    /// Spawn a scheduler driving this service's orchestrator and attach it.
    pub fn start_scheduler(&self, config: SchedulerConfig) -> SchedulerHandle {
        let handle = SyncScheduler::spawn(self.orchestrator.clone(), config);
        self.attach_scheduler(handle.clone());
        handle
    }

    /// Attach a scheduler. Only the first attached handle is kept.
    pub fn attach_scheduler(&self, handle: SchedulerHandle) {
        if self.scheduler.set(handle).is_err() {
            tracing::warn!("Scheduler already attached; ignoring new handle");
        }
    }

    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.get()
    }

    fn notify_changed(&self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.schedule_debounced(self.debounce);
        }
    }

    /// Add a catalog product.
    pub async fn add_product(&self, product: &Product) -> Result<Record> {
        validate_product(product)?;
        let record = self.local.insert_model(product).await?;
        self.notify_changed();
        Ok(record)
    }

    pub async fn get_product(&self, id: &RecordId) -> Result<Option<Product>> {
        self.local.get_model(id).await
    }

    /// Live products, most recently changed first.
    pub async fn list_products(&self, limit: usize, offset: usize) -> Result<Vec<(RecordId, Product)>> {
        self.local.list_models(limit, offset).await
    }

    /// Apply a merge patch to a product. The patched product must stay valid.
    pub async fn update_product(&self, id: &RecordId, patch: &Value) -> Result<Record> {
        let current = self
            .local
            .get(EntityKind::Product, id)
            .await?
            .filter(|record| !record.is_deleted())
            .ok_or_else(|| Error::NotFound(format!("product {id}")))?;

        let mut preview = current.payload;
        merge_patch(&mut preview, patch);
        validate_product(&Product::from_payload(&preview)?)?;

        let record = self.local.update(EntityKind::Product, id, patch).await?;
        self.notify_changed();
        Ok(record)
    }

    pub async fn delete_product(&self, id: &RecordId) -> Result<()> {
        self.local.soft_delete(EntityKind::Product, id).await?;
        self.notify_changed();
        Ok(())
    }

    /// Record a sale: one sale row, one item per line, stock decremented.
    ///
    /// Unit prices are taken from the catalog at the time of sale. Every row
    /// lands in a single local transaction, so a failure leaves no partial sale.
    pub async fn record_sale(
        &self,
        lines: &[LineRequest],
        payment_method: PaymentMethod,
        note: Option<String>,
    ) -> Result<SaleReceipt> {
        if lines.is_empty() {
            return Err(Error::InvalidInput("a sale needs at least one line".into()));
        }

        // one entry per distinct product, in first-seen order
        let mut products: Vec<(Record, Product, i64)> = Vec::new();
        let mut priced = Vec::with_capacity(lines.len());
        for line in lines {
            if line.quantity <= 0 {
                return Err(Error::InvalidInput(format!(
                    "quantity for {} must be positive",
                    line.product_id
                )));
            }
            let slot = match products.iter().position(|(record, ..)| record.id == line.product_id) {
                Some(slot) => slot,
                None => {
                    let record = self
                        .local
                        .get(EntityKind::Product, &line.product_id)
                        .await?
                        .filter(|record| !record.is_deleted())
                        .ok_or_else(|| Error::NotFound(format!("product {}", line.product_id)))?;
                    let product = Product::from_payload(&record.payload)?;
                    let stock = product.stock;
                    products.push((record, product, stock));
                    products.len() - 1
                }
            };
            let (_, product, remaining) = &mut products[slot];
            *remaining = remaining.saturating_sub(line.quantity);
            priced.push((line, product.price_cents));
        }

        let total_cents: i64 = priced
            .iter()
            .map(|(line, unit_price)| line.quantity.saturating_mul(*unit_price))
            .sum();
        let sale = Sale {
            total_cents,
            payment_method,
            completed_at: unix_millis_now(),
            note: crate::util::normalize_text_option(note),
        };

        let staged_sale = self.local.stage_insert_model(&sale)?;
        let sale_id = staged_sale.record.id;
        let mut writes = vec![staged_sale];
        let mut items = Vec::with_capacity(priced.len());
        for (line, unit_price_cents) in priced {
            let item = SaleItem {
                sale_id,
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price_cents,
            };
            let staged_item = self.local.stage_insert_model(&item)?;
            items.push((staged_item.record.id, item));
            writes.push(staged_item);
        }
        for (record, _, remaining) in products {
            if remaining < 0 {
                tracing::warn!(product_id = %record.id, remaining, "Stock went negative");
            }
            writes.push(self.local.stage_update(record, &json!({ "stock": remaining }))?);
        }

        self.local.commit(writes).await?;

        tracing::info!(%sale_id, total_cents, lines = items.len(), "Recorded sale");
        self.notify_changed();
        Ok(SaleReceipt {
            sale_id,
            sale,
            items,
        })
    }

    pub async fn list_sales(&self, limit: usize, offset: usize) -> Result<Vec<(RecordId, Sale)>> {
        self.local.list_models(limit, offset).await
    }

    /// Run an incremental pass, through the scheduler when one is attached.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        match self.scheduler.get() {
            Some(scheduler) => scheduler.trigger_manual().await,
            None => self.orchestrator.run_full_sync().await,
        }
    }

    /// Run a full reconciliation pass.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        match self.scheduler.get() {
            Some(scheduler) => scheduler.trigger_full().await,
            None => self.orchestrator.run_full_reconciliation().await,
        }
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.orchestrator.status().await
    }

    /// List recently resolved sync conflicts.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.orchestrator.conflicts(limit).await
    }

    pub async fn pending_changes(&self) -> Result<u64> {
        self.local.count_all_unsynced().await
    }
}

fn validate_product(product: &Product) -> Result<()> {
    if product.name.trim().is_empty() {
        return Err(Error::InvalidInput("product name must not be empty".into()));
    }
    if product.price_cents < 0 {
        return Err(Error::InvalidInput("product price must not be negative".into()));
    }
    Ok(())
}
