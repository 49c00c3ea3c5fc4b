//! The `RpcTransport` trait and its error type.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use txlistener_core::{ReadError, ReadErrorKind};

use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// JSON-RPC error code used by several providers for "limit exceeded".
pub const RATE_LIMIT_CODE: i64 = -32005;

/// Errors that can occur in the RPC transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP status {code}")]
    Status { code: u16 },

    #[error("{0}")]
    Rpc(JsonRpcError),

    #[error("Rate limited by provider {provider}")]
    RateLimited { provider: String },

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if the request may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        ReadErrorKind::from(self).is_retryable()
    }
}

impl From<&TransportError> for ReadErrorKind {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Http(_) | TransportError::Connect(_) => Self::Transient,
            TransportError::Status { code: 429 } => Self::RateLimited,
            TransportError::Status { code } if *code >= 500 => Self::Transient,
            TransportError::Status { .. } => Self::Other,
            TransportError::Rpc(e) if e.code == RATE_LIMIT_CODE => Self::RateLimited,
            TransportError::Rpc(e) => Self::Rpc { code: e.code },
            TransportError::RateLimited { .. } => Self::RateLimited,
            TransportError::Timeout { .. } => Self::Timeout,
            TransportError::Deserialization(_) => Self::InvalidResponse,
            TransportError::Other(_) => Self::Other,
        }
    }
}

impl From<TransportError> for ReadError {
    fn from(err: TransportError) -> Self {
        ReadError::new(ReadErrorKind::from(&err), err.to_string())
    }
}

/// A connection to one JSON-RPC endpoint.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; a reader shares one transport per
/// chain between all concurrent fetches.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single request and return its response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Identifier for the next request. Transports that multiplex override this.
    fn next_id(&self) -> u64 {
        1
    }

    /// The endpoint URL, for logging.
    fn url(&self) -> &str;

    /// Call `method` and return the raw result value (`Value::Null` if absent).
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let resp = self.send(req).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i64) -> TransportError {
        TransportError::Rpc(JsonRpcError {
            code,
            message: "boom".into(),
            data: None,
        })
    }

    #[test]
    fn classification() {
        let kind = |e: TransportError| ReadError::from(e).kind;
        assert_eq!(kind(TransportError::Status { code: 429 }), ReadErrorKind::RateLimited);
        assert_eq!(kind(rpc(RATE_LIMIT_CODE)), ReadErrorKind::RateLimited);
        assert_eq!(kind(rpc(-32602)), ReadErrorKind::Rpc { code: -32602 });
        assert_eq!(kind(TransportError::Timeout { ms: 50 }), ReadErrorKind::Timeout);
        assert_eq!(kind(TransportError::Connect("refused".into())), ReadErrorKind::Transient);
        assert_eq!(kind(TransportError::Status { code: 503 }), ReadErrorKind::Transient);
        assert_eq!(kind(TransportError::Status { code: 401 }), ReadErrorKind::Other);

        let bad = serde_json::from_str::<Value>("{").unwrap_err();
        assert_eq!(kind(TransportError::from(bad)), ReadErrorKind::InvalidResponse);
    }

    #[test]
    fn retryable() {
        assert!(TransportError::Timeout { ms: 1 }.is_retryable());
        assert!(rpc(RATE_LIMIT_CODE).is_retryable());
        assert!(!rpc(-32601).is_retryable());
        assert!(!TransportError::Other("x".into()).is_retryable());
    }

    #[test]
    fn message_is_kept() {
        let err = ReadError::from(rpc(-32000));
        assert!(err.message.contains("boom"));
    }
}
