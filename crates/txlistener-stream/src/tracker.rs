//! Tip tracker: the highest block that is safe to read under a finality depth.

use std::sync::Arc;

use txlistener_core::{ChainId, ChainReader, ReadError, TrackerConfig};

/// Computes the highest safe block of one chain.
///
/// A block `N` is safe once the chain head is at least `N + depth`. The
/// tracker holds no state besides `(chain_id, depth)` and can be cloned and
/// called concurrently.
#[derive(Clone)]
pub struct TipTracker {
    chain_id: ChainId,
    depth: u64,
    reader: Arc<dyn ChainReader>,
}

impl TipTracker {
    pub fn new(chain_id: ChainId, reader: Arc<dyn ChainReader>, config: &TrackerConfig) -> Self {
        Self {
            chain_id,
            depth: config.depth,
            reader,
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Highest safe block number.
    ///
    /// Returns `0` when the head is not deeper than `depth` (a young chain is
    /// not an error). Reader errors are returned as is.
    pub async fn highest_block(&self) -> Result<u64, ReadError> {
        let head = self.reader.header_by_number(&self.chain_id, None).await?;
        Ok(safe_block(head.number, self.depth))
    }
}

/// `max(0, head - depth)`.
fn safe_block(head: u64, depth: u64) -> u64 {
    head.saturating_sub(depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use txlistener_core::{MemoryChain, ReadErrorKind};

    fn tracker(chain: Arc<MemoryChain>, depth: u64) -> TipTracker {
        TipTracker::new(ChainId::from(1), chain, &TrackerConfig { depth })
    }

    #[tokio::test]
    async fn head_shallower_than_depth_is_zero() {
        let chain = Arc::new(MemoryChain::new());
        chain.set_head(ChainId::from(1), 7);
        assert_eq!(tracker(chain, 10).highest_block().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn head_minus_depth() {
        let chain = Arc::new(MemoryChain::new());
        chain.set_head(ChainId::from(1), 25);
        assert_eq!(tracker(chain.clone(), 10).highest_block().await.unwrap(), 15);
        assert_eq!(tracker(chain, 0).highest_block().await.unwrap(), 25);
    }

    #[test]
    fn head_equal_to_depth() {
        assert_eq!(safe_block(10, 10), 0);
        assert_eq!(safe_block(11, 10), 1);
    }

    #[tokio::test]
    async fn reader_errors_pass_through() {
        let chain = Arc::new(MemoryChain::new());
        chain.fail_head(ChainId::from(1), ReadError::transient("connection reset"));
        let err = tracker(chain, 0).highest_block().await.unwrap_err();
        assert_eq!(err.kind, ReadErrorKind::Transient);
    }
}
