//! The chain source abstraction: read-only access to a full node.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use crate::error::IndexerError;
use crate::types::ChainBlock;

/// Trait for reading blocks from a full node.
///
/// Failures must surface as [`IndexerError::Transport`], carrying the
/// attempted command and its parameters.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// The chain the node serves (`"main"`, `"test"`, `"signet"`, `"regtest"`).
    async fn chain_name(&self) -> Result<String, IndexerError>;

    /// Height of the node's best block.
    async fn block_count(&self) -> Result<u64, IndexerError>;

    /// Hash of the node's active-chain block at `height`.
    async fn block_hash(&self, height: u64) -> Result<String, IndexerError>;

    /// The block with `hash`, including every transaction in full.
    async fn block(&self, hash: &str) -> Result<ChainBlock, IndexerError>;
}

// ─── In-memory chain (for testing) ────────────────────────────────────────────

#[derive(Debug)]
struct ChainState {
    name: String,
    blocks: Vec<ChainBlock>,
    /// Every block ever served, so stale hashes stay fetchable after a reorg.
    known: Vec<ChainBlock>,
    offline: bool,
}

/// A scripted chain for tests and dry runs.
///
/// Holds the active chain as a list indexed by height. Replacing the tail
/// simulates a reorg; going offline makes every call fail as a transport fault.
#[derive(Debug)]
pub struct InMemoryChain {
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(ChainState {
                name: name.into(),
                blocks: Vec::new(),
                known: Vec::new(),
                offline: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block to the active chain. Its height must be the next one.
    pub fn push(&self, block: ChainBlock) {
        let mut state = self.state();
        debug_assert_eq!(block.height as usize, state.blocks.len());
        state.known.push(block.clone());
        state.blocks.push(block);
    }

    /// Drop every active block at or above `height`.
    pub fn truncate(&self, height: u64) {
        self.state().blocks.truncate(height as usize);
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Height of the active tip, `None` if no block was pushed yet.
    pub fn tip(&self) -> Option<u64> {
        self.state().blocks.last().map(|b| b.height)
    }

    fn check_online(
        state: &ChainState,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<(), IndexerError> {
        if state.offline {
            return Err(IndexerError::transport(method, params, "node offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for InMemoryChain {
    async fn chain_name(&self) -> Result<String, IndexerError> {
        let state = self.state();
        Self::check_online(&state, "getblockchaininfo", &[])?;
        Ok(state.name.clone())
    }

    async fn block_count(&self) -> Result<u64, IndexerError> {
        let state = self.state();
        Self::check_online(&state, "getblockcount", &[])?;
        state
            .blocks
            .last()
            .map(|b| b.height)
            .ok_or_else(|| IndexerError::transport("getblockcount", &[], "chain has no blocks"))
    }

    async fn block_hash(&self, height: u64) -> Result<String, IndexerError> {
        let state = self.state();
        let params = [json!(height)];
        Self::check_online(&state, "getblockhash", &params)?;
        state
            .blocks
            .get(height as usize)
            .map(|b| b.hash.clone())
            .ok_or_else(|| {
                IndexerError::transport("getblockhash", &params, "Block height out of range")
            })
    }

    async fn block(&self, hash: &str) -> Result<ChainBlock, IndexerError> {
        let state = self.state();
        let params = [json!(hash), json!(2)];
        Self::check_online(&state, "getblock", &params)?;
        state
            .known
            .iter()
            .rev()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| IndexerError::transport("getblock", &params, "Block not found"))
    }
}
