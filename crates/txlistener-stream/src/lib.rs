//! txlistener-stream: the chain-tailing engine.
//!
//! Per chain, a [`BlockCursor`] walks safe blocks (as reported by a
//! [`TipTracker`]) without gaps, a [`ReceiptDispatcher`] fetches each block's
//! receipts concurrently and releases them in transaction order, and a
//! [`ChainListener`] ties both to a resumable `(block, tx)` position.
//! [`TxListener`] runs one listener per chain.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use txlistener_core::{ChainId, ListenerConfig, MemoryChain};
//! use txlistener_stream::TxListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let reader = Arc::new(MemoryChain::new());
//! let (listener, mut outputs) = TxListener::new(ListenerConfig::default(), reader, None)?;
//! listener.listen(&[ChainId::from(1)]).await?;
//!
//! while let Some(receipt) = outputs.receipts.recv().await {
//!     println!("{} {}", receipt.position(), receipt.tx_hash);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cursor;
pub mod dispatcher;
pub mod handler;
pub mod listener;
pub mod orchestrator;
pub mod tracker;

pub use cursor::{BlockCursor, CursorHandle};
pub use dispatcher::{ReceiptDispatcher, ReceiptStream};
pub use handler::ListenerHandler;
pub use listener::{ChainEvent, ChainListener, ChainListenerBuilder, ChainOutputs, OnExit};
pub use orchestrator::{TxListener, TxListenerOutputs};
pub use tracker::TipTracker;
