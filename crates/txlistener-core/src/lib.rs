//! txlistener-core: foundation types and traits for the ordered receipt listener.
//!
//! # Architecture
//!
//! ```text
//! TxListener (txlistener-stream)
//!     └── ChainListener (one per chain)
//!             ├── TipTracker          (highest safe block, finality depth)
//!             ├── BlockCursor         (gap-free block stream)
//!             └── ReceiptDispatcher   (bounded concurrent fetch, ordered drain)
//!
//! ChainReader        ← implemented by txlistener-evm / MemoryChain
//! PositionResolver   ← implemented by MemoryPositionStore or a downstream log
//! ```
//!
//! This crate owns the data model ([`Block`], [`Receipt`], [`Position`],
//! [`Progress`]), the error taxonomy, the configuration surface and the
//! narrow collaborator traits the engine consumes.

pub mod config;
pub mod error;
pub mod memory;
pub mod position;
pub mod reader;
pub mod retry;
pub mod types;

pub use config::{BlockConfig, ListenerConfig, ReturnConfig, StartConfig, TrackerConfig};
pub use error::{ConfigError, ListenerError, ReadError, ReadErrorKind, TxListenerError};
pub use memory::MemoryChain;
pub use position::{
    parse_position, MemoryPositionStore, PositionResolver, StartPosition, StartPositions,
    StoredPosition,
};
pub use reader::ChainReader;
pub use retry::{RetryConfig, RetryPolicy, RetryingReader};
pub use types::{Block, ChainId, Header, Log, Position, Progress, Receipt, Transaction};
