//! [`ChainSource`] over bitcoind's JSON-RPC interface.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use chainmirror_core::chain::ChainSource;
use chainmirror_core::error::IndexerError;
use chainmirror_core::types::ChainBlock;

use crate::error::TransportError;
use crate::request::JsonRpcRequest;
use crate::transport::RpcTransport;

/// `getblock` verbosity that includes every transaction decoded.
const VERBOSITY_FULL: u8 = 2;

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    chain: String,
}

/// Reads the chain from a bitcoind node.
pub struct BitcoindSource<T: RpcTransport> {
    transport: T,
    next_id: AtomicU64,
}

impl<T: RpcTransport> BitcoindSource<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Call `method` and deserialize its result.
    ///
    /// Every failure, including a node-side error or an unexpected result
    /// shape, becomes [`IndexerError::Transport`] naming the command.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, IndexerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fault =
            |reason: &dyn std::fmt::Display| IndexerError::transport(method, &params, reason);

        tracing::trace!(id, method, url = %self.transport.url(), "RPC call");
        let resp = self
            .transport
            .send(JsonRpcRequest::new(id, method, params.clone()))
            .await
            .map_err(|e| fault(&e))?;
        let result = resp
            .into_result()
            .map_err(|e| fault(&TransportError::Rpc(e)))?;
        serde_json::from_value(result).map_err(|e| fault(&TransportError::Deserialization(e)))
    }
}

#[async_trait]
impl<T: RpcTransport> ChainSource for BitcoindSource<T> {
    async fn chain_name(&self) -> Result<String, IndexerError> {
        let info: BlockchainInfo = self.call("getblockchaininfo", vec![]).await?;
        Ok(info.chain)
    }

    async fn block_count(&self) -> Result<u64, IndexerError> {
        self.call("getblockcount", vec![]).await
    }

    async fn block_hash(&self, height: u64) -> Result<String, IndexerError> {
        self.call("getblockhash", vec![json!(height)]).await
    }

    async fn block(&self, hash: &str) -> Result<ChainBlock, IndexerError> {
        self.call("getblock", vec![json!(hash), json!(VERBOSITY_FULL)])
            .await
    }
}
