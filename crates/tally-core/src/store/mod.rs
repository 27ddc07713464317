//! Local and remote entity stores
//!
//! One repository implementation serves both sides of the sync boundary;
//! only the transport and the flavor marker differ.

mod backend;
mod repository;
mod statements;

pub use backend::StatementBackend;
pub(crate) use backend::{apply_write, fetch_rows};
pub use repository::{
    EntityStore, Local, LocalStore, PutOutcome, Remote, RemoteStore, StagedWrite, StoreFlavor,
};
pub use statements::StatementSet;
