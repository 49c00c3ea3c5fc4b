//! Per-chain consumer hooks for [`TxListener::listen_with`](crate::TxListener::listen_with).

use async_trait::async_trait;

use txlistener_core::{Block, ChainId, ListenerError, Receipt, TxListenerError};

/// User-provided consumer of chain output.
///
/// Hooks for one chain are called sequentially, in emission order: a block
/// before its receipts, receipts in transaction order. Different chains are
/// handled concurrently. An error returned from a hook stops that chain only.
#[async_trait]
pub trait ListenerHandler: Send + Sync + 'static {
    /// Called once before any chain starts.
    async fn setup(&self, _chains: &[ChainId]) -> Result<(), TxListenerError> {
        Ok(())
    }

    async fn handle_receipt(&self, receipt: Receipt) -> Result<(), TxListenerError>;

    /// Called for every mined block when blocks are returned.
    async fn handle_block(&self, _block: Block) -> Result<(), TxListenerError> {
        Ok(())
    }

    /// Called for every chain error when errors are returned.
    async fn handle_error(&self, error: ListenerError) -> Result<(), TxListenerError> {
        tracing::warn!(chain_id = %error.chain_id(), error = %error, "Unhandled listener error");
        Ok(())
    }

    /// Called once after every chain stopped.
    async fn cleanup(&self) {}
}
