//! Starting positions: parsing, per-chain defaults and the resume store.
//!
//! A chain listener starts either at an explicit `(block, tx)` position, at
//! the current highest safe block (`latest`), or right after the last receipt
//! observed downstream (`oldest`). The last one is answered by a
//! [`PositionResolver`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ReadError};
use crate::types::{ChainId, Position, Receipt};

// ─── StartPosition ────────────────────────────────────────────────────────────

/// Where a chain listener should begin, before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// An explicit position. `genesis` parses to block 0.
    At(Position),
    /// The highest safe block at start-up; the tx index is forced to 0.
    Latest,
    /// Resume after the last receipt observed downstream.
    Oldest,
}

impl FromStr for StartPosition {
    type Err = ConfigError;

    /// Parses `<blockNumber|genesis|latest|oldest>[-<txIndex>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (block, tx) = match s.split_once('-') {
            Some((block, tx)) => (block, Some(tx)),
            None => (s, None),
        };
        let tx_index = match tx {
            Some(tx) => tx
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidPosition(s.to_string()))?,
            None => 0,
        };
        match block {
            "genesis" => Ok(Self::At(Position::new(0, tx_index))),
            "latest" => Ok(Self::Latest),
            "oldest" => Ok(Self::Oldest),
            number => number
                .parse::<u64>()
                .map(|n| Self::At(Position::new(n, tx_index)))
                .map_err(|_| ConfigError::InvalidBlock(number.to_string())),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(pos) => write!(f, "{pos}"),
            Self::Latest => write!(f, "latest"),
            Self::Oldest => write!(f, "oldest"),
        }
    }
}

/// Parse a `<chainID>:<blockNumber|genesis|latest|oldest>[-<txIndex>]` string.
pub fn parse_position(s: &str) -> Result<(ChainId, StartPosition), ConfigError> {
    let (chain, rest) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidPosition(s.to_string()))?;
    let chain_id = chain.parse::<ChainId>()?;
    let start = rest.parse::<StartPosition>().map_err(|e| match e {
        ConfigError::InvalidBlock(_) | ConfigError::InvalidPosition(_) => {
            ConfigError::InvalidPosition(s.to_string())
        }
        other => other,
    })?;
    Ok((chain_id, start))
}

// ─── StartPositions ───────────────────────────────────────────────────────────

/// Parsed per-chain starting positions plus the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPositions {
    positions: HashMap<ChainId, StartPosition>,
    default: StartPosition,
}

impl Default for StartPositions {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
            default: StartPosition::Oldest,
        }
    }
}

impl StartPositions {
    pub fn new(default: StartPosition) -> Self {
        Self {
            positions: HashMap::new(),
            default,
        }
    }

    /// Parse the default and every per-chain entry.
    pub fn parse(default: &str, positions: &[String]) -> Result<Self, ConfigError> {
        let mut parsed = Self::new(default.parse()?);
        for raw in positions {
            let (chain_id, start) = parse_position(raw)?;
            if parsed.positions.insert(chain_id, start).is_some() {
                return Err(ConfigError::DuplicatePosition(chain_id));
            }
        }
        Ok(parsed)
    }

    /// The configured position for `chain_id`, falling back to the default.
    pub fn for_chain(&self, chain_id: &ChainId) -> StartPosition {
        self.positions.get(chain_id).copied().unwrap_or(self.default)
    }

    pub fn default_position(&self) -> StartPosition {
        self.default
    }

    /// Iterate explicitly configured chains.
    pub fn iter(&self) -> impl Iterator<Item = (&ChainId, &StartPosition)> {
        self.positions.iter()
    }
}

// ─── PositionResolver ─────────────────────────────────────────────────────────

/// Answers "what was the last receipt observed downstream for this chain?".
///
/// Backed by whatever records consumer progress: the last message produced
/// to a topic, a database row, or [`MemoryPositionStore`].
#[async_trait]
pub trait PositionResolver: Send + Sync {
    /// Position of the last observed receipt, or `None` if nothing was
    /// recorded for this chain yet.
    async fn last_known_position(&self, chain_id: &ChainId) -> Result<Option<Position>, ReadError>;
}

/// A recorded position with its update time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPosition {
    pub chain_id: ChainId,
    pub position: Position,
    /// Unix timestamp of the last update.
    pub updated_at: i64,
}

/// In-memory position store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    data: Mutex<HashMap<ChainId, StoredPosition>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `receipt` has been handled downstream.
    ///
    /// Positions only move forward; recording an older receipt is a no-op.
    pub fn record(&self, receipt: &Receipt) {
        self.advance(receipt.chain_id, receipt.position());
    }

    /// Move the chain's position forward to `position`.
    pub fn advance(&self, chain_id: ChainId, position: Position) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        match data.get(&chain_id) {
            Some(stored) if stored.position >= position => {}
            _ => {
                data.insert(
                    chain_id,
                    StoredPosition {
                        chain_id,
                        position,
                        updated_at: chrono::Utc::now().timestamp(),
                    },
                );
            }
        }
    }

    pub fn get(&self, chain_id: &ChainId) -> Option<StoredPosition> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain_id)
            .cloned()
    }

    /// Forget the chain's position (next `oldest` start begins at genesis).
    pub fn reset(&self, chain_id: &ChainId) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chain_id);
    }
}

#[async_trait]
impl PositionResolver for MemoryPositionStore {
    async fn last_known_position(&self, chain_id: &ChainId) -> Result<Option<Position>, ReadError> {
        Ok(self.get(chain_id).map(|stored| stored.position))
    }
}
