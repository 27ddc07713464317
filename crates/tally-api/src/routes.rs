use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tally_core::executor::{
    authorize, ExecRequest, ExecResponse, ExecutorConfig, ImageStore, QueryExecutor, RequestPayload,
    SchemaFlavor, StatementVerb,
};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, verify_token};
use crate::config::AppConfig;
use crate::error::AppError;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    executor: QueryExecutor,
}

impl AppState {
    /// Boot the authoritative executor described by `config`.
    pub async fn start(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let executor_config = match config.data_dir.as_ref() {
            Some(dir) => ExecutorConfig::durable(
                SchemaFlavor::Remote,
                ImageStore::for_origin(dir, &config.origin),
            ),
            None => {
                tracing::warn!("TALLY_API_DATA_DIR not set; remote store is in memory");
                ExecutorConfig::in_memory(SchemaFlavor::Remote)
            }
        }
        .with_timeout(config.executor_timeout)
        .with_max_pending(config.executor_max_pending);

        let executor = QueryExecutor::start(executor_config).await?;
        Ok(Self { config, executor })
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/statements", post(execute_statement))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    pending_requests: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        pending_requests: state.executor.pending_requests(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    verify_token(token, &state.config.api_token)?;
    Ok(next.run(request).await)
}

/// Run one statement request against the authoritative store.
///
/// Statements that fail the allow-list are refused with 403 before reaching
/// the executor, as are schema changes and physical deletes. Execution
/// failures come back as an error outcome with status 200.
async fn execute_statement(
    State(state): State<AppState>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecResponse>, AppError> {
    let statements = match &request.payload {
        RequestPayload::Single(statement) => std::slice::from_ref(statement),
        RequestPayload::Batch(statements) => statements.as_slice(),
    };
    if statements.is_empty() {
        return Err(AppError::bad_request("batch contains no statements"));
    }
    if statements.len() > state.config.max_batch_statements {
        return Err(AppError::bad_request(format!(
            "batch exceeds {} statements",
            state.config.max_batch_statements
        )));
    }
    for statement in statements {
        let authorized = authorize(&statement.sql)?;
        if authorized.verb.is_schema_change() {
            return Err(AppError::forbidden("schema changes are not allowed"));
        }
        if authorized.verb == StatementVerb::Delete {
            return Err(AppError::forbidden(
                "physical deletes are not allowed; tombstone with UPDATE",
            ));
        }
    }

    let outcome = state.executor.dispatch(request.kind, request.payload).await?;
    tracing::debug!(request_id = request.id, kind = ?request.kind, "Executed statement request");
    Ok(Json(ExecResponse {
        id: request.id,
        outcome,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tally_core::executor::{Outcome, RequestKind, Statement};
    use tally_core::models::{EntityKind, Product};
    use tally_core::{HttpRemote, RemoteStore, StatementBackend};
    use tower::ServiceExt;

    const TOKEN: &str = "test-token-0123456789";

    async fn router() -> Router {
        let state = AppState::start(Arc::new(AppConfig::for_tests(TOKEN))).await.unwrap();
        app_router(state)
    }

    fn statement_request(token: Option<&str>, body: &Value) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/v1/statements")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn single(id: u64, kind: RequestKind, sql: &str, params: Vec<Value>) -> Value {
        serde_json::to_value(ExecRequest {
            id,
            kind,
            payload: RequestPayload::Single(Statement::with_params(sql, params)),
        })
        .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_needs_no_token() {
        let response = router()
            .await
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn statements_require_the_shared_token() {
        let app = router().await;
        let body = single(1, RequestKind::Read, "SELECT 1 AS one", vec![]);

        let missing = app.clone().oneshot(statement_request(None, &body)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(statement_request(Some("not-the-token"), &body))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schema_changes_and_chained_statements_are_forbidden() {
        let app = router().await;

        let create = single(
            2,
            RequestKind::Write,
            "CREATE TABLE evil (id TEXT PRIMARY KEY)",
            vec![],
        );
        let response = app.clone().oneshot(statement_request(Some(TOKEN), &create)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await["error"],
            "Statement not allowed: schema changes are not allowed"
        );

        let chained = single(
            3,
            RequestKind::Read,
            "SELECT * FROM products; DROP TABLE products",
            vec![],
        );
        let response = app.oneshot(statement_request(Some(TOKEN), &chained)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn physical_deletes_are_forbidden_even_inside_a_batch() {
        let app = router().await;

        let delete = single(
            5,
            RequestKind::Write,
            "DELETE FROM products WHERE id = ?",
            vec![json!("p1")],
        );
        let response = app.clone().oneshot(statement_request(Some(TOKEN), &delete)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_json(response).await["error"],
            "Statement not allowed: physical deletes are not allowed; tombstone with UPDATE"
        );

        let batch = serde_json::to_value(ExecRequest {
            id: 6,
            kind: RequestKind::WriteBatch,
            payload: RequestPayload::Batch(vec![
                Statement::with_params(
                    "INSERT INTO products (id, payload, updated_at, deleted_at) VALUES (?, ?, ?, NULL)",
                    vec![json!("p1"), json!("{}"), json!(1)],
                ),
                Statement::new("DELETE FROM products"),
            ]),
        })
        .unwrap();
        let response = app.clone().oneshot(statement_request(Some(TOKEN), &batch)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // the refused batch never reached the executor
        let count = single(7, RequestKind::Read, "SELECT COUNT(*) AS n FROM products", vec![]);
        let response = app.oneshot(statement_request(Some(TOKEN), &count)).await.unwrap();
        let decoded: ExecResponse = serde_json::from_value(body_json(response).await).unwrap();
        let rows = decoded.outcome.into_result().unwrap().into_rows().unwrap();
        assert_eq!(rows[0]["n"], json!(0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn durable_store_survives_a_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(AppConfig {
            data_dir: Some(tmp.path().to_path_buf()),
            ..AppConfig::for_tests(TOKEN)
        });

        let first = app_router(AppState::start(Arc::clone(&config)).await.unwrap());
        let insert = single(
            20,
            RequestKind::Write,
            "INSERT INTO products (id, payload, updated_at, deleted_at) VALUES (?, ?, ?, NULL)",
            vec![json!("p1"), json!(r#"{"name":"Tea"}"#), json!(5)],
        );
        let response = first.oneshot(statement_request(Some(TOKEN), &insert)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(ImageStore::for_origin(tmp.path(), &config.origin).exists());

        let second = app_router(AppState::start(config).await.unwrap());
        let select = single(21, RequestKind::Read, "SELECT id, payload FROM products", vec![]);
        let response = second.oneshot(statement_request(Some(TOKEN), &select)).await.unwrap();
        let decoded: ExecResponse = serde_json::from_value(body_json(response).await).unwrap();
        let rows = decoded.outcome.into_result().unwrap().into_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("p1"));
        assert_eq!(rows[0]["payload"], json!(r#"{"name":"Tea"}"#));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_batches_are_rejected() {
        let batch = serde_json::to_value(ExecRequest {
            id: 4,
            kind: RequestKind::BatchRead,
            payload: RequestPayload::Batch(vec![Statement::new("SELECT 1"); 5]),
        })
        .unwrap();
        let response = router()
            .await
            .oneshot(statement_request(Some(TOKEN), &batch))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_then_read_echoes_request_ids() {
        let app = router().await;

        let insert = single(
            10,
            RequestKind::Write,
            "INSERT INTO products (id, payload, updated_at, deleted_at) VALUES (?, ?, ?, NULL)",
            vec![json!("p1"), json!(r#"{"name":"Tea"}"#), json!(5)],
        );
        let response = app.clone().oneshot(statement_request(Some(TOKEN), &insert)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let decoded: ExecResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(decoded.id, 10);
        assert_eq!(decoded.outcome.into_result().unwrap().changes().unwrap(), 1);

        let select = single(11, RequestKind::Read, "SELECT id FROM products", vec![]);
        let response = app.oneshot(statement_request(Some(TOKEN), &select)).await.unwrap();
        let decoded: ExecResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(decoded.id, 11);
        let rows = decoded.outcome.into_result().unwrap().into_rows().unwrap();
        assert_eq!(rows[0]["id"], json!("p1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sql_errors_come_back_as_error_outcomes() {
        let body = single(12, RequestKind::Read, "SELECT * FROM customers", vec![]);
        let response = router()
            .await
            .oneshot(statement_request(Some(TOKEN), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let decoded: ExecResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert!(matches!(decoded.outcome, Outcome::Error { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_remote_talks_to_the_router() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router().await;
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let remote = HttpRemote::new(format!("http://{addr}"), Some(TOKEN.to_string())).unwrap();
        assert!(remote.is_available().await);

        let store = RemoteStore::new(remote);
        let record = store.insert_model(&Product::new("Tea", 250, 3)).await.unwrap();
        let fetched = store.get_model::<Product>(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Tea");
        assert_eq!(store.count(EntityKind::Product).await.unwrap(), 1);

        let denied = HttpRemote::new(format!("http://{addr}"), Some("wrong".to_string()))
            .unwrap()
            .dispatch(
                RequestKind::Read,
                RequestPayload::Single(Statement::new("SELECT 1")),
            )
            .await;
        assert!(matches!(denied, Err(tally_core::Error::RemoteUnavailable(_))));
    }
}
