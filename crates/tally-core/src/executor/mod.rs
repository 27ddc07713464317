//! Sandboxed query executor
//!
//! [`QueryExecutor`] is a cheap cloneable handle to a worker thread that owns
//! the embedded database. Callers post requests tagged with an id and await
//! the correlated response; the worker executes them one at a time.

mod guard;
mod image;
mod module;
mod protocol;
mod schema;
mod worker;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub use guard::{authorize, normalize, AuthorizedStatement, StatementVerb};
pub use image::{ImageStore, IMAGE_FILE_NAME};
pub use module::{
    DirectoryModuleSource, LoadedModule, ModuleLoader, ModuleSource, ModuleSpec, TRUSTED_MODULES,
};
pub use protocol::{
    ExecRequest, ExecResponse, ExecSuccess, Outcome, RequestKind, RequestPayload, Row, Statement,
};
pub use schema::{SchemaFlavor, SYNC_CONFLICTS_TABLE, SYNC_METADATA_TABLE};

use crate::error::{Error, Result};
use worker::Worker;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PENDING: usize = 256;

/// Settings for starting an executor.
#[derive(Clone)]
pub struct ExecutorConfig {
    pub flavor: SchemaFlavor,
    /// Durable image location; `None` keeps the database purely in memory
    pub image: Option<ImageStore>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Maximum number of requests awaiting a response
    pub max_pending: usize,
    /// Trusted module source; module loads fail when unset
    pub modules: Option<ModuleLoader>,
    /// Module loaded during boot, if any
    pub engine_module: Option<String>,
}

impl ExecutorConfig {
    pub fn in_memory(flavor: SchemaFlavor) -> Self {
        Self {
            flavor,
            image: None,
            timeout: DEFAULT_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            modules: None,
            engine_module: None,
        }
    }

    pub fn durable(flavor: SchemaFlavor, image: ImageStore) -> Self {
        Self {
            image: Some(image),
            ..Self::in_memory(flavor)
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    #[must_use]
    pub fn with_modules(mut self, loader: ModuleLoader) -> Self {
        self.modules = Some(loader);
        self
    }

    #[must_use]
    pub fn with_engine_module(mut self, path: impl Into<String>) -> Self {
        self.engine_module = Some(path.into());
        self
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ExecutorConfig")
            .field("flavor", &self.flavor)
            .field("image", &self.image)
            .field("timeout", &self.timeout)
            .field("max_pending", &self.max_pending)
            .field("modules", &self.modules.is_some())
            .field("engine_module", &self.engine_module)
            .finish()
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<ExecResponse>>;

struct Inner {
    requests: Sender<ExecRequest>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    timeout: Duration,
    max_pending: usize,
    flavor: SchemaFlavor,
    modules: Option<ModuleLoader>,
    engine: Mutex<Option<LoadedModule>>,
}

/// Handle to the sandboxed database worker.
#[derive(Clone)]
pub struct QueryExecutor {
    inner: Arc<Inner>,
}

impl QueryExecutor {
    /// Boot the worker: load the engine module if configured, then restore
    /// the stored image or create a fresh schema.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(config: ExecutorConfig) -> Result<Self> {
        let engine = match (&config.engine_module, &config.modules) {
            (Some(path), Some(loader)) => {
                let loader = loader.clone();
                let path = path.clone();
                Some(
                    tokio::task::spawn_blocking(move || loader.load(&path))
                        .await
                        .map_err(|error| Error::Database(format!("module load panicked: {error}")))??,
                )
            }
            (Some(path), None) => {
                return Err(Error::UntrustedModule(format!(
                    "{path}: no trusted module source configured"
                )))
            }
            (None, _) => None,
        };

        let (request_tx, request_rx) = std::sync::mpsc::channel();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ExecResponse>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let image = config.image.clone();
        let flavor = config.flavor;
        std::thread::Builder::new()
            .name("tally-executor".into())
            .spawn(move || match Worker::boot(image, flavor) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(()));
                    worker.run(request_rx, response_tx);
                }
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                }
            })?;
        ready_rx.await.map_err(|_| Error::ExecutorClosed)??;

        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let router = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let slot = lock(&router).remove(&response.id);
                match slot {
                    Some(reply) => {
                        let _ = reply.send(response);
                    }
                    None => tracing::debug!(
                        request_id = response.id,
                        "Dropping response for released request"
                    ),
                }
            }
        });

        Ok(Self {
            inner: Arc::new(Inner {
                requests: request_tx,
                pending,
                next_id: AtomicU64::new(1),
                timeout: config.timeout,
                max_pending: config.max_pending,
                flavor,
                modules: config.modules,
                engine: Mutex::new(engine),
            }),
        })
    }

    /// In-memory executor without persistence (useful for testing)
    pub async fn in_memory(flavor: SchemaFlavor) -> Result<Self> {
        Self::start(ExecutorConfig::in_memory(flavor)).await
    }

    pub fn flavor(&self) -> SchemaFlavor {
        self.inner.flavor
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Post a request and await its correlated outcome.
    ///
    /// Errors only for transport failures (busy, closed, timeout); statement
    /// failures come back as [`Outcome::Error`] or [`Outcome::Rejected`].
    pub async fn dispatch(&self, kind: RequestKind, payload: RequestPayload) -> Result<Outcome> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = lock(&self.inner.pending);
            if pending.len() >= self.inner.max_pending {
                return Err(Error::ExecutorBusy(pending.len()));
            }
            pending.insert(id, reply_tx);
        }

        if self
            .inner
            .requests
            .send(ExecRequest { id, kind, payload })
            .is_err()
        {
            lock(&self.inner.pending).remove(&id);
            return Err(Error::ExecutorClosed);
        }

        match tokio::time::timeout(self.inner.timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response.outcome),
            Ok(Err(_)) => Err(Error::ExecutorClosed),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                tracing::warn!(request_id = id, timeout = ?self.inner.timeout, "Executor request timed out");
                Err(Error::Timeout(id))
            }
        }
    }

    /// Execute one statement. Reads return rows, writes return change counts.
    pub async fn execute(&self, statement: &str, params: Vec<Value>) -> Result<ExecSuccess> {
        let authorized = authorize(statement)?;
        let kind = if authorized.verb.is_read() {
            RequestKind::Read
        } else {
            RequestKind::Write
        };
        self.run(kind, Statement::with_params(statement, params)).await
    }

    /// Run a statement with an explicit request kind.
    pub async fn run(&self, kind: RequestKind, statement: Statement) -> Result<ExecSuccess> {
        self.dispatch(kind, RequestPayload::Single(statement))
            .await?
            .into_result()
    }

    pub async fn query(&self, statement: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        self.run(RequestKind::Read, Statement::with_params(statement, params))
            .await?
            .into_rows()
    }

    /// Several reads in one round-trip.
    pub async fn batch_read(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>> {
        self.dispatch(RequestKind::BatchRead, RequestPayload::Batch(statements))
            .await?
            .into_result()?
            .into_batch()
    }

    /// Several writes in one transaction; nothing is applied if any fails.
    pub async fn write_batch(&self, statements: Vec<Statement>) -> Result<Vec<u64>> {
        self.dispatch(RequestKind::WriteBatch, RequestPayload::Batch(statements))
            .await?
            .into_result()?
            .into_batch_changes()
    }

    /// Load an allow-listed module. Failure affects only this call.
    pub async fn load_module(&self, path: &str) -> Result<()> {
        let loader = self
            .inner
            .modules
            .clone()
            .ok_or_else(|| Error::UntrustedModule(format!("{path}: no trusted module source configured")))?;
        let owned = path.to_string();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&owned))
            .await
            .map_err(|error| Error::Database(format!("module load panicked: {error}")))??;
        *lock(&self.inner.engine) = Some(loaded);
        Ok(())
    }

    /// Path and exports of the currently loaded module.
    pub fn loaded_module(&self) -> Option<(String, Vec<String>)> {
        lock(&self.inner.engine)
            .as_ref()
            .map(|module| (module.path.clone(), module.exports.clone()))
    }
}

impl fmt::Debug for QueryExecutor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("QueryExecutor")
            .field("flavor", &self.inner.flavor)
            .field("pending", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
