//! HTTP transport to the authoritative store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::{ExecRequest, ExecResponse, Outcome, RequestKind, RequestPayload};
use crate::store::StatementBackend;
use crate::util::{compact_text, is_http_url, normalize_text_option};

const STATEMENTS_PATH: &str = "/v1/statements";
const HEALTH_PATH: &str = "/healthz";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Executor-protocol client for the cloud store.
///
/// A client built without an endpoint is permanently unavailable, so a device
/// with no remote configured keeps working offline.
#[derive(Clone)]
pub struct HttpRemote {
    endpoint: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
    health_timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        Self::build(Some(normalize_endpoint(endpoint.into())?), token, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client with no endpoint; every request fails with `RemoteUnavailable`.
    pub fn disabled() -> Result<Self> {
        Self::build(None, None, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client from optional settings: disabled when `endpoint` is unset.
    pub fn from_settings(
        endpoint: Option<&str>,
        token: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = normalize_text_option(endpoint.map(str::to_string))
            .map(normalize_endpoint)
            .transpose()?;
        let token = normalize_text_option(token.map(str::to_string));
        Self::build(endpoint, token, request_timeout)
    }

    fn build(endpoint: Option<String>, token: Option<String>, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint,
            token,
            client: reqwest::Client::builder().timeout(request_timeout).build()?,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    #[must_use]
    pub const fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub const fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    fn url(&self, path: &str) -> Result<String> {
        self.endpoint
            .as_ref()
            .map(|endpoint| format!("{endpoint}{path}"))
            .ok_or_else(|| Error::RemoteUnavailable("no remote endpoint configured".into()))
    }

    async fn post_request(&self, request: &ExecRequest) -> Result<ExecResponse> {
        let mut builder = self
            .client
            .post(self.url(STATEMENTS_PATH)?)
            .header("Accept", "application/json")
            .json(request);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let decoded = response.json::<ExecResponse>().await?;
        if decoded.id != request.id {
            return Err(Error::Remote(format!(
                "response id {} does not match request {}",
                decoded.id, request.id
            )));
        }
        Ok(decoded)
    }
}

impl StatementBackend for HttpRemote {
    async fn dispatch(&self, kind: RequestKind, payload: RequestPayload) -> Result<Outcome> {
        let request = ExecRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            payload,
        };
        let response = self.post_request(&request).await?;
        Ok(response.outcome)
    }

    async fn is_available(&self) -> bool {
        let Ok(url) = self.url(HEALTH_PATH) else {
            return false;
        };
        match self.client.get(url).timeout(self.health_timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!(%error, "Remote health check failed");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn map_status(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::FORBIDDEN => Error::UnauthorizedStatement(message),
        StatusCode::UNAUTHORIZED => Error::RemoteUnavailable(message),
        _ => Error::Remote(message),
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("remote endpoint must not be empty".to_string()))?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "remote endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint(" https://pos.example.com/ ".to_string()).unwrap(),
            "https://pos.example.com"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let remote = HttpRemote::new("https://pos.example.com", Some("secret".into())).unwrap();
        let debug = format!("{remote:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn status_mapping_distinguishes_rejections() {
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, r#"{"error":"schema changes are not allowed"}"#),
            Error::UnauthorizedStatement(message) if message == "schema changes are not allowed (403)"
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, ""),
            Error::RemoteUnavailable(message) if message == "HTTP 401"
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, "upstream down"),
            Error::Remote(message) if message == "upstream down (502)"
        ));
    }

    #[tokio::test]
    async fn unconfigured_remote_is_unavailable() {
        let remote = HttpRemote::from_settings(None, Some("token"), Duration::from_secs(1)).unwrap();
        assert!(!remote.is_configured());
        assert!(!remote.is_available().await);

        let result = remote
            .dispatch(
                RequestKind::Read,
                RequestPayload::Single(crate::executor::Statement::new("SELECT 1")),
            )
            .await;
        assert!(matches!(result, Err(Error::RemoteUnavailable(_))));
    }
}
