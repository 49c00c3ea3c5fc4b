//! The `ChainReader` trait, the only way the engine talks to a node.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ReadError;
use crate::types::{Block, ChainId, Header, Receipt};

/// Read access to chain state, backed by one or more nodes.
///
/// Implementations may apply their own retry/backoff (see
/// [`RetryingReader`](crate::retry::RetryingReader)); the engine treats every
/// returned error as final for that call.
///
/// # Thread Safety
/// Calls are issued concurrently from many tasks; implementations must be
/// `Send + Sync` and are usually shared as `Arc<dyn ChainReader>`.
#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    /// Header of block `number`, or of the latest block when `number` is `None`.
    async fn header_by_number(
        &self,
        chain_id: &ChainId,
        number: Option<u64>,
    ) -> Result<Header, ReadError>;

    /// Full block with its ordered transactions; `None` if not mined yet.
    async fn block_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<Block>, ReadError>;

    /// Receipt of a mined transaction; `None` if the node does not know it.
    async fn transaction_receipt(
        &self,
        chain_id: &ChainId,
        tx_hash: &str,
    ) -> Result<Option<Receipt>, ReadError>;
}

#[async_trait]
impl<R: ChainReader + ?Sized> ChainReader for Arc<R> {
    async fn header_by_number(
        &self,
        chain_id: &ChainId,
        number: Option<u64>,
    ) -> Result<Header, ReadError> {
        (**self).header_by_number(chain_id, number).await
    }

    async fn block_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<Block>, ReadError> {
        (**self).block_by_number(chain_id, number).await
    }

    async fn transaction_receipt(
        &self,
        chain_id: &ChainId,
        tx_hash: &str,
    ) -> Result<Option<Receipt>, ReadError> {
        (**self).transaction_receipt(chain_id, tx_hash).await
    }
}
