//! Data models for Tally

mod catalog;
mod record;
mod sync_conflict;

pub use catalog::{EntityModel, PaymentMethod, Product, Sale, SaleItem};
pub use record::{merge_patch, EntityKind, Record, RecordId};
pub use sync_conflict::{ConflictEntry, Resolution, SyncConflict};
