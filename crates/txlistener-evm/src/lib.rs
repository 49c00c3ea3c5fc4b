//! txlistener-evm: a [`ChainReader`](txlistener_core::ChainReader) for EVM
//! nodes speaking JSON-RPC over HTTP.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use txlistener_core::{ChainId, RetryConfig, RetryingReader};
//! use txlistener_evm::{EvmChainReader, HttpTransport};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::with_url("https://rpc.example.org")?;
//! let reader = EvmChainReader::new().with_chain(ChainId::from(1), Arc::new(transport));
//! let reader = RetryingReader::new(reader, RetryConfig::default());
//! # let _ = reader;
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod reader;
pub mod request;
pub mod transport;

pub use http::{HttpTransport, HttpTransportConfig};
pub use reader::EvmChainReader;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use transport::{RpcTransport, TransportError};
