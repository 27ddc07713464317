//! tally-core - Core library for Tally
//!
//! This crate contains the sandboxed query executor, the local and remote
//! entity stores, and the sync engine shared by every Tally interface (CLI,
//! statement API).

pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod remote;
pub mod services;
pub mod store;
pub mod sync;
pub mod util;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use executor::{ExecutorConfig, QueryExecutor, SchemaFlavor};
pub use models::{EntityKind, PaymentMethod, Product, Record, RecordId, Sale, SaleItem};
pub use remote::HttpRemote;
pub use services::{LineRequest, PosService, SaleReceipt};
pub use store::{LocalStore, RemoteStore, StatementBackend};
pub use sync::{SchedulerHandle, SyncOrchestrator, SyncReport, SyncScheduler};
