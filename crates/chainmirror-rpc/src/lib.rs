//! chainmirror-rpc: bitcoind JSON-RPC chain source.
//!
//! ```text
//! BitcoindSource<T: RpcTransport> ──► ChainSource
//!        └── HttpRpcClient  (reqwest, basic auth, timeout, retry)
//! ```

pub mod bitcoind;
pub mod client;
pub mod error;
pub mod request;
pub mod retry;
pub mod transport;

pub use bitcoind::BitcoindSource;
pub use client::{HttpClientConfig, HttpRpcClient};
pub use error::TransportError;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::{RetryConfig, RetryPolicy};
pub use transport::RpcTransport;
