//! Executor request/response protocol
//!
//! The same message types travel over the in-process worker channel and over
//! HTTP to the authoritative store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A result row: column name to value, in the order the statement selected them.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Read,
    Write,
    BatchRead,
    /// Writes applied in one transaction; any failure rolls back the whole batch
    WriteBatch,
}

/// A statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPayload {
    Single(Statement),
    Batch(Vec<Statement>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub id: u64,
    pub kind: RequestKind,
    pub payload: RequestPayload,
}

/// Successful execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecSuccess {
    Rows(Vec<Row>),
    BatchRows(Vec<Vec<Row>>),
    Changes { changes: u64, last_insert_id: i64 },
    BatchChanges(Vec<u64>),
}

impl ExecSuccess {
    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            Self::Rows(rows) => Ok(rows),
            other => Err(Error::Database(format!("expected rows, got {other:?}"))),
        }
    }

    pub fn into_batch(self) -> Result<Vec<Vec<Row>>> {
        match self {
            Self::BatchRows(results) => Ok(results),
            other => Err(Error::Database(format!(
                "expected batch rows, got {other:?}"
            ))),
        }
    }

    pub fn into_batch_changes(self) -> Result<Vec<u64>> {
        match self {
            Self::BatchChanges(changes) => Ok(changes),
            other => Err(Error::Database(format!(
                "expected batch changes, got {other:?}"
            ))),
        }
    }

    pub fn changes(&self) -> Result<u64> {
        match self {
            Self::Changes { changes, .. } => Ok(*changes),
            other => Err(Error::Database(format!("expected changes, got {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Outcome {
    Success(ExecSuccess),
    Error { message: String },
    Rejected { reason: String },
}

impl Outcome {
    pub fn into_result(self) -> Result<ExecSuccess> {
        match self {
            Self::Success(success) => Ok(success),
            Self::Error { message } => Err(Error::Database(message)),
            Self::Rejected { reason } => Err(Error::UnauthorizedStatement(reason)),
        }
    }

    pub(crate) fn from_error(error: &Error) -> Self {
        match error {
            Error::UnauthorizedStatement(reason) => Self::Rejected {
                reason: reason.clone(),
            },
            other => Self::Error {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub id: u64,
    pub outcome: Outcome,
}
