//! Connection Client: the collaborator that owns the actual network protocol.
//!
//! The supervisor only sees the [`ConnectionClient`] trait. The gateway ships
//! one implementation, [`HttpBridgeClient`], which drives a protocol bridge
//! sidecar over HTTP:
//! - `POST {base}/sessions/{id}/connect`    → `{"jid": "..."}`
//! - `POST {base}/sessions/{id}/disconnect`
//! - `GET  {base}/sessions/{id}/status`     → `{"status": "connected"}`

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::BridgeConfig;
use crate::models::tenant::TenantId;

// ============================================================================
// ConnectionClient trait
// ============================================================================

/// Status of a tenant's connection as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionStatus {
    /// `Disconnected` and `Failed` end the connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Failed)
    }
}

#[async_trait]
pub trait ConnectionClient: Send + Sync {
    /// Establish the tenant's connection. Returns the external account id,
    /// which is empty while the account is not yet paired.
    async fn connect(&self, tenant_id: TenantId) -> Result<String, ConnectionError>;

    async fn disconnect(&self, tenant_id: TenantId) -> Result<(), ConnectionError>;

    async fn status(&self, tenant_id: TenantId) -> Result<ConnectionStatus, ConnectionError>;

    /// Client name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bridge error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("All {attempts} connect attempts failed")]
    RetryExhausted { attempts: usize },

    #[error("Connection rejected: {0}")]
    Rejected(String),
}

impl ConnectionError {
    /// Transport failures and 5xx/429 answers are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ConnectionError::Api { code, .. } => *code >= 500 || *code == 429,
            ConnectionError::RetryExhausted { .. } | ConnectionError::Rejected(_) => false,
        }
    }
}

// ============================================================================
// Bridge API structs (private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    #[serde(default)]
    jid: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ConnectionStatus,
}

#[derive(Debug, Deserialize)]
struct BridgeErrorResponse {
    error: Option<String>,
}

// ============================================================================
// HttpBridgeClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpBridgeClient {
    client: Client,
    config: BridgeConfig,
}

impl HttpBridgeClient {
    pub fn new(config: &BridgeConfig) -> Result<Self, ConnectionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config: BridgeConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config.clone()
            },
        })
    }

    fn url(&self, tenant_id: TenantId, action: &str) -> String {
        format!("{}/sessions/{}/{}", self.config.base_url, tenant_id, action)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    async fn connect_once(&self, tenant_id: TenantId) -> Result<String, ConnectionError> {
        let response = self
            .authorize(self.client.post(self.url(tenant_id, "connect")))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: ConnectResponse = response.json().await?;
        Ok(body.jid)
    }
}

#[async_trait]
impl ConnectionClient for HttpBridgeClient {
    async fn connect(&self, tenant_id: TenantId) -> Result<String, ConnectionError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.connect_once(tenant_id),
            |e: &ConnectionError| {
                let retry = e.is_transient();
                if retry {
                    tracing::debug!(tenant_id, error = %e, "Bridge connect failed, retrying");
                }
                retry
            },
        )
        .await;

        match result {
            Ok(jid) => Ok(jid),
            Err(e) if e.is_transient() => {
                let attempts = self.config.max_retries + 1;
                tracing::error!(
                    tenant_id,
                    attempts,
                    error = %e,
                    "All bridge connect attempts failed"
                );
                Err(ConnectionError::RetryExhausted { attempts })
            }
            Err(e) => Err(e),
        }
    }

    async fn disconnect(&self, tenant_id: TenantId) -> Result<(), ConnectionError> {
        let response = self
            .authorize(self.client.post(self.url(tenant_id, "disconnect")))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn status(&self, tenant_id: TenantId) -> Result<ConnectionStatus, ConnectionError> {
        let response = self
            .authorize(self.client.get(self.url(tenant_id, "status")))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: StatusResponse = response.json().await?;
        Ok(body.status)
    }

    fn name(&self) -> &str {
        "http-bridge"
    }
}

/// Turn a non-2xx bridge answer into [`ConnectionError::Api`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ConnectionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<BridgeErrorResponse>(&body)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or(body);

    if status.as_u16() == 409 {
        return Err(ConnectionError::Rejected(message));
    }

    Err(ConnectionError::Api {
        code: status.as_u16(),
        message,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> BridgeConfig {
        BridgeConfig {
            base_url,
            api_key: Some("bridge-key".to_string()),
            timeout_seconds: 5,
            max_retries: 2,
            retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_connect_returns_jid_and_sends_api_key() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/sessions/7/connect"))
            .and(header("x-api-key", "bridge-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"jid": "5511@s.whatsapp.net"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let jid = client.connect(7).await.expect("connect should succeed");
        assert_eq!(jid, "5511@s.whatsapp.net");
    }

    #[tokio::test]
    async fn test_connect_unpaired_account_returns_empty_jid() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .and(path("/sessions/3/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&mock_server)
            .await;

        assert_eq!(client.connect(3).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_connect_retries_on_server_error() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": "bridge warming up"
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"jid": "1@s"})),
            )
            .mount(&mock_server)
            .await;

        assert_eq!(client.connect(1).await.unwrap(), "1@s");
    }

    #[tokio::test]
    async fn test_connect_exhausts_retries() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&mock_server)
            .await;

        let err = client.connect(1).await.unwrap_err();
        assert!(
            matches!(err, ConnectionError::RetryExhausted { attempts: 3 }),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_connect_client_error_not_retried() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "unknown session"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.connect(1).await {
            Err(ConnectionError::Api { code, message }) => {
                assert_eq!(code, 404);
                assert_eq!(message, "unknown session");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflict_maps_to_rejected() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(mock_server.uri())).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("logged out"))
            .mount(&mock_server)
            .await;

        let err = client.connect(1).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Rejected(ref m) if m == "logged out"));
    }

    #[tokio::test]
    async fn test_status_and_disconnect() {
        let mock_server = MockServer::start().await;
        let client = HttpBridgeClient::new(&test_config(format!("{}/", mock_server.uri())))
            .unwrap();

        Mock::given(method("GET"))
            .and(path("/sessions/9/status"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "failed"})),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/9/disconnect"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let status = client.status(9).await.unwrap();
        assert_eq!(status, ConnectionStatus::Failed);
        assert!(status.is_terminal());
        client.disconnect(9).await.unwrap();
    }

    #[test]
    fn test_transient_classification() {
        assert!(ConnectionError::Api { code: 502, message: String::new() }.is_transient());
        assert!(ConnectionError::Api { code: 429, message: String::new() }.is_transient());
        assert!(!ConnectionError::Api { code: 401, message: String::new() }.is_transient());
        assert!(!ConnectionError::Rejected("x".into()).is_transient());
    }
}
