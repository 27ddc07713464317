//! Statement transport seam shared by the local and remote stores

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::executor::{Outcome, QueryExecutor, RequestKind, RequestPayload, Row, Statement};

/// Anything that can execute executor-protocol requests.
///
/// Implemented by the in-process [`QueryExecutor`] and by
/// [`HttpRemote`](crate::remote::HttpRemote) for the authoritative store.
pub trait StatementBackend: Send + Sync {
    /// Submit one request and return its outcome.
    ///
    /// `Err` means the request never produced an outcome (transport failure,
    /// timeout); statement failures come back as an [`Outcome`].
    fn dispatch(
        &self,
        kind: RequestKind,
        payload: RequestPayload,
    ) -> impl Future<Output = Result<Outcome>> + Send;

    /// Whether the backend can currently serve requests.
    fn is_available(&self) -> impl Future<Output = bool> + Send;
}

impl StatementBackend for QueryExecutor {
    fn dispatch(
        &self,
        kind: RequestKind,
        payload: RequestPayload,
    ) -> impl Future<Output = Result<Outcome>> + Send {
        Self::dispatch(self, kind, payload)
    }

    async fn is_available(&self) -> bool {
        true
    }
}

impl<B: StatementBackend> StatementBackend for Arc<B> {
    fn dispatch(
        &self,
        kind: RequestKind,
        payload: RequestPayload,
    ) -> impl Future<Output = Result<Outcome>> + Send {
        B::dispatch(self, kind, payload)
    }

    fn is_available(&self) -> impl Future<Output = bool> + Send {
        B::is_available(self)
    }
}

/// Run a single read and return its rows.
pub(crate) async fn fetch_rows<B: StatementBackend>(
    backend: &B,
    sql: String,
    params: Vec<Value>,
) -> Result<Vec<Row>> {
    backend
        .dispatch(
            RequestKind::Read,
            RequestPayload::Single(Statement::with_params(sql, params)),
        )
        .await?
        .into_result()?
        .into_rows()
}

/// Run a single write and return the number of changed rows.
pub(crate) async fn apply_write<B: StatementBackend>(
    backend: &B,
    sql: String,
    params: Vec<Value>,
) -> Result<u64> {
    backend
        .dispatch(
            RequestKind::Write,
            RequestPayload::Single(Statement::with_params(sql, params)),
        )
        .await?
        .into_result()?
        .changes()
}

/// Run several writes as one transaction and return each one's change count.
pub(crate) async fn apply_write_batch<B: StatementBackend>(
    backend: &B,
    statements: Vec<Statement>,
) -> Result<Vec<u64>> {
    backend
        .dispatch(RequestKind::WriteBatch, RequestPayload::Batch(statements))
        .await?
        .into_result()?
        .into_batch_changes()
}
