//! Executor worker thread
//!
//! The worker exclusively owns the `SQLite` connection and runs one request at
//! a time, in arrival order. A failing request produces an error or rejection
//! response; the loop itself only ends when every sender is gone.

use std::sync::mpsc::Receiver;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::guard::{authorize, AuthorizedStatement};
use super::image::ImageStore;
use super::protocol::{
    ExecRequest, ExecResponse, ExecSuccess, Outcome, RequestKind, RequestPayload, Row, Statement,
};
use super::schema::{self, SchemaFlavor};
use crate::error::{Error, Result};

pub(crate) struct Worker {
    conn: Connection,
    image: Option<ImageStore>,
}

impl Worker {
    /// Open the in-memory database and restore or create its contents.
    pub(crate) fn boot(image: Option<ImageStore>, flavor: SchemaFlavor) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;

        let restored = match image.as_ref() {
            Some(store) => store.load_into(&mut conn)?,
            None => false,
        };

        let mut worker = Self { conn, image };
        if restored {
            tracing::info!("Executor booted from stored image");
        } else {
            for statement in schema::statements(flavor) {
                let authorized = authorize(&statement)?;
                worker.conn.execute(&authorized.sql, [])?;
            }
            worker.persist()?;
            tracing::info!(?flavor, "Executor booted with fresh schema");
        }

        worker.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(worker)
    }

    /// Serve requests until the request channel closes.
    pub(crate) fn run(
        mut self,
        requests: Receiver<ExecRequest>,
        responses: UnboundedSender<ExecResponse>,
    ) {
        while let Ok(request) = requests.recv() {
            let response = self.handle(request);
            if responses.send(response).is_err() {
                break;
            }
        }
        tracing::debug!("Executor worker stopped");
    }

    pub(crate) fn handle(&mut self, request: ExecRequest) -> ExecResponse {
        let id = request.id;
        let outcome = match self.dispatch(request.kind, &request.payload) {
            Ok(success) => Outcome::Success(success),
            Err(error) => {
                tracing::debug!(request_id = id, %error, "Executor request failed");
                Outcome::from_error(&error)
            }
        };
        ExecResponse { id, outcome }
    }

    fn dispatch(&mut self, kind: RequestKind, payload: &RequestPayload) -> Result<ExecSuccess> {
        match (kind, payload) {
            (RequestKind::Read, RequestPayload::Single(statement)) => {
                let authorized = authorize_as(statement, true)?;
                Ok(ExecSuccess::Rows(self.read(&authorized, &statement.params)?))
            }
            (RequestKind::BatchRead, RequestPayload::Batch(statements)) => {
                let authorized = statements
                    .iter()
                    .map(|statement| authorize_as(statement, true))
                    .collect::<Result<Vec<_>>>()?;
                let mut results = Vec::with_capacity(statements.len());
                for (statement, authorized) in statements.iter().zip(&authorized) {
                    results.push(self.read(authorized, &statement.params)?);
                }
                Ok(ExecSuccess::BatchRows(results))
            }
            (RequestKind::Write, RequestPayload::Single(statement)) => {
                let authorized = authorize_as(statement, false)?;
                self.write(&authorized, &statement.params)
            }
            (RequestKind::WriteBatch, RequestPayload::Batch(statements)) => {
                let authorized = statements
                    .iter()
                    .map(|statement| authorize_as(statement, false))
                    .collect::<Result<Vec<_>>>()?;
                self.write_batch(statements, &authorized)
            }
            (kind, _) => Err(Error::UnauthorizedStatement(format!(
                "payload shape does not match {kind:?} request"
            ))),
        }
    }

    fn read(&self, statement: &AuthorizedStatement, params: &[Value]) -> Result<Vec<Row>> {
        let mut prepared = self.conn.prepare(&statement.sql)?;
        if !prepared.readonly() {
            return Err(Error::UnauthorizedStatement(
                "read request would modify the database".into(),
            ));
        }

        let names = prepared
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let mut rows = prepared.query(params_from_iter(params.iter().map(to_sql_value)))?;

        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            let mut mapped = Row::new();
            for (index, name) in names.iter().enumerate() {
                mapped.insert(name.clone(), from_sql_value(row.get_ref(index)?));
            }
            output.push(mapped);
        }
        Ok(output)
    }

    fn write(&mut self, statement: &AuthorizedStatement, params: &[Value]) -> Result<ExecSuccess> {
        let changes = self
            .conn
            .execute(&statement.sql, params_from_iter(params.iter().map(to_sql_value)))?;
        let last_insert_id = self.conn.last_insert_rowid();
        self.persist()?;
        Ok(ExecSuccess::Changes {
            changes: changes as u64,
            last_insert_id,
        })
    }

    /// Apply every statement inside one transaction. The first failure rolls
    /// back the statements before it.
    fn write_batch(
        &mut self,
        statements: &[Statement],
        authorized: &[AuthorizedStatement],
    ) -> Result<ExecSuccess> {
        let transaction = self.conn.transaction()?;
        let mut changes = Vec::with_capacity(statements.len());
        for (statement, authorized) in statements.iter().zip(authorized) {
            let changed = transaction.execute(
                &authorized.sql,
                params_from_iter(statement.params.iter().map(to_sql_value)),
            )?;
            changes.push(changed as u64);
        }
        transaction.commit()?;
        self.persist()?;
        Ok(ExecSuccess::BatchChanges(changes))
    }

    fn persist(&self) -> Result<()> {
        if let Some(image) = self.image.as_ref() {
            image.save_from(&self.conn).map_err(|error| {
                tracing::error!(%error, "Failed to persist database image");
                Error::Database(format!("write applied but image was not persisted: {error}"))
            })?;
        }
        Ok(())
    }
}

fn authorize_as(statement: &Statement, read: bool) -> Result<AuthorizedStatement> {
    let authorized = authorize(&statement.sql)?;
    if authorized.verb.is_read() != read {
        let expected = if read { "read" } else { "write" };
        return Err(Error::UnauthorizedStatement(format!(
            "{:?} statement submitted as {expected}",
            authorized.verb
        )));
    }
    Ok(authorized)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::Array(blob.iter().map(|byte| Value::from(*byte)).collect()),
    }
}
