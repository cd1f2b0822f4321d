//! The `RpcTransport` trait: one JSON-RPC request in, one response out.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Anything that can deliver a JSON-RPC request to a node.
///
/// A node-side error object is a successful delivery: it comes back inside
/// the [`JsonRpcResponse`], not as an `Err`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// The endpoint this transport talks to, for logs.
    fn url(&self) -> &str;
}
