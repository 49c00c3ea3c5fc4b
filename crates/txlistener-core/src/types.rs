//! Shared types for the listener pipeline.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── ChainId ──────────────────────────────────────────────────────────────────

/// Identifier of a blockchain network.
///
/// Arbitrary precision (up to 256 bits) and compared by value, so it can be
/// used directly as a map key for per-chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(U256);

impl ChainId {
    pub const fn new(id: U256) -> Self {
        Self(id)
    }

    /// Returns the underlying integer.
    pub fn as_u256(&self) -> U256 {
        self.0
    }

    /// `0x`-prefixed lowercase hex, as used in position strings.
    pub fn to_hex(&self) -> String {
        format!("0x{:x}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(U256::from(id))
    }
}

impl From<U256> for ChainId {
    fn from(id: U256) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainId {
    type Err = ConfigError;

    /// Accepts decimal (`"1"`) or `0x`-prefixed hex (`"0x2a"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => None,
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None if s.is_empty() => None,
            None => U256::from_str_radix(s, 10).ok(),
        };
        parsed
            .map(Self)
            .ok_or_else(|| ConfigError::InvalidChainId(s.to_string()))
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// Block header metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

/// A transaction as it appears inside a mined block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash (`0x…`).
    pub hash: String,
    /// Sender address.
    pub from: String,
    /// Recipient address; `None` for contract creation.
    pub to: Option<String>,
    pub nonce: u64,
}

/// A mined block: header plus its transactions in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Chain the block was read from.
    pub chain_id: ChainId,
    pub header: Header,
    /// Transactions, ordered by their index in the block.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    /// Number of transactions in the block.
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Header) -> bool {
        self.header.number == parent.number + 1 && self.header.parent_hash == parent.hash
    }
}

// ─── Receipt ──────────────────────────────────────────────────────────────────

/// A log emitted during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Emitting contract address.
    pub address: String,
    pub topics: Vec<String>,
    /// Hex-encoded data payload.
    pub data: String,
    /// Index of the log within the block.
    pub log_index: u64,
    /// `true` if the log was removed by a reorg.
    #[serde(default)]
    pub removed: bool,
}

/// Execution outcome of one mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Chain the receipt was read from.
    pub chain_id: ChainId,
    pub tx_hash: String,
    pub block_hash: String,
    pub block_number: u64,
    /// Index of the transaction within its block.
    pub tx_index: u64,
    /// `1` for success, `0` for failure (post-Byzantium semantics).
    pub status: u64,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    /// Address of the created contract, if any.
    pub contract_address: Option<String>,
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Returns `true` if the transaction succeeded.
    pub fn is_success(&self) -> bool {
        self.status == 1
    }

    /// Position of this receipt in the chain's transaction sequence.
    pub fn position(&self) -> Position {
        Position::new(self.block_number, self.tx_index)
    }
}

// ─── Position / Progress ──────────────────────────────────────────────────────

/// A `(block_number, tx_index)` pointer into a chain's transaction sequence.
///
/// `tx_index` is the index of the next transaction to emit within the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub block_number: u64,
    pub tx_index: u64,
}

impl Position {
    pub const fn new(block_number: u64, tx_index: u64) -> Self {
        Self {
            block_number,
            tx_index,
        }
    }

    /// Position of the first transaction of the first block.
    pub const fn genesis() -> Self {
        Self::new(0, 0)
    }

    /// The position right after this one within the same block.
    pub fn next_tx(self) -> Self {
        Self::new(self.block_number, self.tx_index + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.block_number, self.tx_index)
    }
}

/// Snapshot of how far a chain listener has advanced relative to the tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Block the listener is currently on.
    pub current_block: u64,
    /// Next transaction index to emit within `current_block`.
    pub tx_index: u64,
    /// Highest safe block; `None` if the tip could not be read.
    pub highest_block: Option<u64>,
}

impl Progress {
    /// Number of safe blocks not yet fully emitted.
    pub fn lag(&self) -> Option<u64> {
        self.highest_block
            .map(|head| (head + 1).saturating_sub(self.current_block))
    }

    /// Returns `true` if every safe block has been emitted.
    pub fn is_caught_up(&self) -> bool {
        self.lag() == Some(0)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn chain_id_parses_decimal_and_hex() {
        let a: ChainId = "42".parse().unwrap();
        let b: ChainId = "0x2a".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "42");
        assert_eq!(a.to_hex(), "0x2a");
    }

    #[test]
    fn chain_id_rejects_garbage() {
        assert!("".parse::<ChainId>().is_err());
        assert!("0x".parse::<ChainId>().is_err());
        assert!("mainnet".parse::<ChainId>().is_err());
    }

    #[test]
    fn chain_id_is_a_value_key() {
        let mut map = HashMap::new();
        map.insert(ChainId::from(1), "a");
        let key: ChainId = "0x1".parse().unwrap();
        assert_eq!(map.get(&key), Some(&"a"));
    }

    #[test]
    fn chain_id_beyond_u64() {
        let id: ChainId = "0x10000000000000000".parse().unwrap();
        assert_eq!(id.to_string(), "18446744073709551616");
    }

    #[test]
    fn progress_lag() {
        let behind = Progress {
            current_block: 10,
            tx_index: 0,
            highest_block: Some(14),
        };
        assert_eq!(behind.lag(), Some(5));
        assert!(!behind.is_caught_up());

        let caught_up = Progress {
            current_block: 15,
            tx_index: 0,
            highest_block: Some(14),
        };
        assert!(caught_up.is_caught_up());

        let unknown = Progress {
            current_block: 15,
            tx_index: 0,
            highest_block: None,
        };
        assert_eq!(unknown.lag(), None);
    }

    #[test]
    fn position_ordering() {
        assert!(Position::new(5, 3) < Position::new(6, 0));
        assert_eq!(Position::new(5, 3).next_tx(), Position::new(5, 4));
        assert_eq!(Position::new(7, 1).to_string(), "7-1");
    }
}
