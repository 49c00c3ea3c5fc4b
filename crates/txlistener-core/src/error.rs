//! Error types for the listener pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChainId;

// ─── ReadError ────────────────────────────────────────────────────────────────

/// Closed classification of chain read failures.
///
/// Produced by [`ChainReader`](crate::reader::ChainReader) implementations so
/// callers never inspect error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadErrorKind {
    /// The requested object is not (yet) known to the node.
    NotFound,
    /// Connection refused, reset, or another transient network failure.
    Transient,
    /// The request did not complete in time.
    Timeout,
    /// The provider asked us to slow down.
    RateLimited,
    /// The node answered with something we could not interpret.
    InvalidResponse,
    /// A JSON-RPC error object returned by the node.
    Rpc { code: i64 },
    Other,
}

impl ReadErrorKind {
    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Transient | Self::Timeout | Self::RateLimited
        )
    }
}

impl fmt::Display for ReadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Transient => write!(f, "transient"),
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::Rpc { code } => write!(f, "rpc error {code}"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A failed call against a chain reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ReadError {
    pub kind: ReadErrorKind,
    pub message: String,
}

impl ReadError {
    pub fn new(kind: ReadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::Transient, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::InvalidResponse, message)
    }

    /// Returns `true` if the error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ─── ListenerError ────────────────────────────────────────────────────────────

/// A chain-scoped failure surfaced by a chain listener.
///
/// Every variant names the chain it happened on; one chain's errors never
/// affect another chain.
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    #[error("chain {chain_id}: failed to read highest block: {source}")]
    Tip { chain_id: ChainId, source: ReadError },

    #[error("chain {chain_id}: failed to fetch block {block_number}: {source}")]
    BlockFetch {
        chain_id: ChainId,
        block_number: u64,
        source: ReadError,
    },

    #[error("chain {chain_id}: failed to fetch receipt {tx_hash} (block {block_number}, tx {tx_index}): {source}")]
    ReceiptFetch {
        chain_id: ChainId,
        block_number: u64,
        tx_index: u64,
        tx_hash: String,
        source: ReadError,
    },

    #[error("chain {chain_id}: receipt {tx_hash} missing (block {block_number}, tx {tx_index})")]
    ReceiptMissing {
        chain_id: ChainId,
        block_number: u64,
        tx_index: u64,
        tx_hash: String,
    },

    #[error("chain {chain_id}: receipt fetch for tx {tx_index} of block {block_number} was abandoned")]
    ReceiptAbandoned {
        chain_id: ChainId,
        block_number: u64,
        tx_index: u64,
    },
}

impl ListenerError {
    /// The chain this error happened on.
    pub fn chain_id(&self) -> &ChainId {
        match self {
            Self::Tip { chain_id, .. }
            | Self::BlockFetch { chain_id, .. }
            | Self::ReceiptFetch { chain_id, .. }
            | Self::ReceiptMissing { chain_id, .. }
            | Self::ReceiptAbandoned { chain_id, .. } => chain_id,
        }
    }

    /// The underlying read error, if the failure came from the chain reader.
    pub fn read_error(&self) -> Option<&ReadError> {
        match self {
            Self::Tip { source, .. }
            | Self::BlockFetch { source, .. }
            | Self::ReceiptFetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ─── ConfigError ──────────────────────────────────────────────────────────────

/// Errors raised while parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid chain id {0:?}")]
    InvalidChainId(String),

    #[error("could not parse position {0:?} (expected format <chainID>:<blockNumber|genesis|latest|oldest>[-<txIndex>])")]
    InvalidPosition(String),

    #[error("{0:?} is an invalid starting block, expected 'latest', 'oldest', 'genesis' or an integer")]
    InvalidBlock(String),

    #[error("start position for chain {0} given more than once")]
    DuplicatePosition(ChainId),

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

// ─── TxListenerError ──────────────────────────────────────────────────────────

/// Errors returned by the multi-chain orchestrator.
#[derive(Debug, Error)]
pub enum TxListenerError {
    /// The chain already has a registered listener. Running listeners are
    /// unaffected.
    #[error("chain {0} is already being listened")]
    AlreadyListening(ChainId),

    #[error("tx-listener has been closed")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to resolve starting position for chain {chain_id}: {source}")]
    PositionResolution { chain_id: ChainId, source: ReadError },

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("handler failed on chain {chain_id}: {reason}")]
    Handler { chain_id: ChainId, reason: String },

    #[error("handler setup failed: {0}")]
    Setup(String),
}

impl TxListenerError {
    pub fn handler(chain_id: ChainId, reason: impl Into<String>) -> Self {
        Self::Handler {
            chain_id,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error only concerns the call that produced it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyListening(_))
    }
}
