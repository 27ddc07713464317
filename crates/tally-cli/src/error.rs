use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Product name cannot be empty")]
    EmptyName,
    #[error("Record ID cannot be empty")]
    EmptyId,
    #[error("Nothing to change; pass at least one field")]
    EmptyEdit,
    #[error("No {kind} found for id/prefix: {query}")]
    RecordNotFound { kind: &'static str, query: String },
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set TALLY_REMOTE_URL (and TALLY_REMOTE_TOKEN) or pass --remote-url."
    )]
    SyncNotConfigured,
}
