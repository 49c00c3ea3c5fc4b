//! HTTP JSON-RPC transport over `reqwest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{RpcTransport, TransportError};

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A single-endpoint HTTP JSON-RPC client.
///
/// Retries are not done here; wrap the reader in a
/// [`RetryingReader`](txlistener_core::RetryingReader) for that.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    timeout_ms: u64,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            client,
            timeout_ms: config.request_timeout.as_millis() as u64,
            next_id: AtomicU64::new(1),
        })
    }

    /// Transport with default timeouts.
    pub fn with_url(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpTransportConfig::default())
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout { ms: self.timeout_ms }
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_decode() {
            TransportError::Other(format!("invalid response body: {e}"))
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        tracing::trace!(url = %self.url, method = %req.method, id = %req.id, "rpc request");

        let resp = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                provider: self.url.clone(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(|e| self.map_reqwest(e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn url(&self) -> &str {
        &self.url
    }
}
