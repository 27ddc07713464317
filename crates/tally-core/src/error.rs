//! Error types for tally-core

use thiserror::Error;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Module path is not in the trusted allow-list or escapes the trusted root
    #[error("Untrusted module: {0}")]
    UntrustedModule(String),

    /// Module exceeds the size declared in its allow-list entry
    #[error("Module {path} is {actual} bytes, limit is {limit}")]
    ModuleTooLarge {
        /// Allow-listed path
        path: String,
        /// Fetched size in bytes
        actual: u64,
        /// Declared maximum
        limit: u64,
    },

    /// Module loaded but does not satisfy its export contract
    #[error("Module contract violation: {0}")]
    ModuleContractViolation(String),

    /// Statement rejected by the executor's allow-list
    #[error("Unauthorized statement: {0}")]
    UnauthorizedStatement(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Remote store is unreachable or not configured
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// A reconciliation pass is already running
    #[error("Sync already in progress")]
    SyncAlreadyInProgress,

    /// Scheduler gave up after the configured number of attempts
    #[error("Sync failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// Executor request exceeded its timeout
    #[error("Executor request {0} timed out")]
    Timeout(u64),

    /// Executor has too many requests in flight
    #[error("Executor busy: {0} requests pending")]
    ExecutorBusy(usize),

    /// Executor worker is gone
    #[error("Executor closed")]
    ExecutorClosed,

    /// Remote store rejected or failed a request
    #[error("Remote error: {0}")]
    Remote(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for unexpected failures the scheduler should retry.
    ///
    /// Structured outcomes (guard failures, rejections, bootstrap failures)
    /// are never retried.
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UntrustedModule(_)
                | Self::ModuleTooLarge { .. }
                | Self::ModuleContractViolation(_)
                | Self::UnauthorizedStatement(_)
                | Self::NotFound(_)
                | Self::RemoteUnavailable(_)
                | Self::SyncAlreadyInProgress
                | Self::RetriesExhausted { .. }
                | Self::InvalidInput(_)
        )
    }
}
