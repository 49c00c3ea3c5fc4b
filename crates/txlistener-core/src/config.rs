//! Listener configuration.
//!
//! Recognized options (flat names as used by deployments):
//!
//! | option                    | field                  | default    |
//! |---------------------------|------------------------|------------|
//! | `listener.block.backoff`  | `block.backoff_ms`     | `1000`     |
//! |                           | `block.max_backoff_ms` | `5000`     |
//! | `listener.block.limit`    | `block.limit`          | `40`       |
//! | `listener.tracker.depth`  | `tracker.depth`        | `0`        |
//! | `listener.start`          | `start.positions`      | `[]`       |
//! | `listener.start.default`  | `start.default`        | `"oldest"` |
//! |                           | `return.blocks`        | `false`    |
//! |                           | `return.errors`        | `false`    |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::position::StartPositions;

/// Block cursor pacing and receipt fetch concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Pause between two checks for a newly mined block (milliseconds).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound the pause grows to while the chain stays idle (milliseconds).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Maximum number of receipt fetches in flight for one block.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 5_000 }
fn default_limit() -> usize { 40 }

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            limit: default_limit(),
        }
    }
}

impl BlockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn fetch_limit(&self) -> usize {
        self.limit
    }
}

/// Finality policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Number of blocks behind the tip before a block is considered final.
    #[serde(default)]
    pub depth: u64,
}

/// Where each chain starts listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartConfig {
    /// Position used for chains without an explicit entry
    /// (`genesis`, `latest`, `oldest` or a block number).
    #[serde(default = "default_start")]
    pub default: String,
    /// Per-chain positions, `<chainID>:<blockNumber|genesis|latest|oldest>[-<txIndex>]`.
    #[serde(default)]
    pub positions: Vec<String>,
}

fn default_start() -> String { "oldest".into() }

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            default: default_start(),
            positions: vec![],
        }
    }
}

impl StartConfig {
    /// Parse the configured strings into structured positions.
    pub fn parse(&self) -> Result<StartPositions, ConfigError> {
        StartPositions::parse(&self.default, &self.positions)
    }
}

/// Which optional output channels a chain listener populates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnConfig {
    /// Forward every mined block on the blocks channel.
    #[serde(default)]
    pub blocks: bool,
    /// Forward errors on the errors channel instead of closing the chain.
    #[serde(default)]
    pub errors: bool,
}

/// Full configuration of a `TxListener`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub block: BlockConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub start: StartConfig,
    #[serde(default, rename = "return")]
    pub returns: ReturnConfig,
}

impl ListenerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Check value ranges and that start positions parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block.limit == 0 {
            return Err(ConfigError::Invalid {
                key: "block.limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.block.backoff_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "block.backoff_ms",
                reason: "must be at least 1ms".into(),
            });
        }
        if self.block.max_backoff_ms < self.block.backoff_ms {
            return Err(ConfigError::Invalid {
                key: "block.max_backoff_ms",
                reason: format!(
                    "{} is lower than block.backoff_ms ({})",
                    self.block.max_backoff_ms, self.block.backoff_ms
                ),
            });
        }
        self.start.parse()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::StartPosition;
    use crate::types::{ChainId, Position};

    #[test]
    fn defaults() {
        let cfg = ListenerConfig::default();
        assert_eq!(cfg.block.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.block.fetch_limit(), 40);
        assert_eq!(cfg.tracker.depth, 0);
        assert_eq!(cfg.start.default, "oldest");
        assert!(!cfg.returns.blocks);
        assert!(!cfg.returns.errors);
        cfg.validate().unwrap();
    }

    #[test]
    fn from_json_partial() {
        let cfg = ListenerConfig::from_json(
            r#"{
                "block": { "limit": 8 },
                "tracker": { "depth": 12 },
                "start": { "default": "latest", "positions": ["0x2a:100-3"] },
                "return": { "errors": true }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.block.limit, 8);
        assert_eq!(cfg.block.backoff_ms, 1_000);
        assert_eq!(cfg.tracker.depth, 12);
        assert!(cfg.returns.errors);

        let starts = cfg.start.parse().unwrap();
        assert_eq!(
            starts.for_chain(&ChainId::from(42)),
            StartPosition::At(Position::new(100, 3))
        );
        assert_eq!(starts.for_chain(&ChainId::from(1)), StartPosition::Latest);
    }

    #[test]
    fn rejects_zero_limit() {
        let err = ListenerConfig::from_json(r#"{ "block": { "limit": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "block.limit", .. }));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let err = ListenerConfig::from_json(
            r#"{ "block": { "backoff_ms": 2000, "max_backoff_ms": 500 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "block.max_backoff_ms", .. }));
    }

    #[test]
    fn rejects_bad_position() {
        let err = ListenerConfig::from_json(r#"{ "start": { "positions": ["nope"] } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPosition(_)));
    }
}
