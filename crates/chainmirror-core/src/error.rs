//! Error types for the chainmirror pipeline.

use thiserror::Error;

/// Errors that can occur while mirroring the chain.
///
/// A stored chain that disagrees with the node is *not* an error; it is
/// reported as [`BlockPresence::Divergent`](crate::ledger::BlockPresence).
#[derive(Debug, Error)]
pub enum IndexerError {
    /// A chain source call failed (network, node or decoding error).
    #[error("RPC call `{method}` with params {params} failed: {reason}")]
    Transport {
        method: String,
        params: String,
        reason: String,
    },

    /// A ledger store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An operation that must touch exactly `expected` valid rows touched a different count.
    #[error("{operation}: expected {expected} valid row(s), found {affected}")]
    RowCount {
        operation: String,
        expected: u64,
        affected: u64,
    },

    /// An input references an output that is not currently valid in the store.
    #[error("Input {txid}:{vin} spends {prev_txid}:{prev_vout}, which has no valid output")]
    DanglingSpend {
        txid: String,
        vin: u32,
        prev_txid: String,
        prev_vout: u32,
    },

    /// The stored genesis block is not the node's genesis block.
    #[error("Stored genesis {stored} differs from node genesis {live}")]
    GenesisMismatch { stored: String, live: String },

    #[error("No valid block stored at height {height}")]
    MissingBlock { height: u64 },

    /// The node returned a block that does not have the expected shape.
    #[error("Malformed block at height {height}: {reason}")]
    MalformedBlock { height: u64, reason: String },

    #[error("Invalid address {address} on {network}: {reason}")]
    InvalidAddress {
        address: String,
        network: String,
        reason: String,
    },

    #[error("Config error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Build a transport fault for `method` called with `params`.
    pub fn transport(
        method: impl Into<String>,
        params: &[serde_json::Value],
        reason: impl ToString,
    ) -> Self {
        Self::Transport {
            method: method.into(),
            params: serde_json::Value::Array(params.to_vec()).to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a row-count consistency fault.
    pub fn row_count(operation: impl Into<String>, expected: u64, affected: u64) -> Self {
        Self::RowCount {
            operation: operation.into(),
            expected,
            affected,
        }
    }

    /// Returns `true` for faults that are expected to clear up on their own
    /// (node or database unreachable), as opposed to data-consistency faults.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Store(_))
    }

    /// Returns `true` if the error means the stored data disagrees with itself.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(
            self,
            Self::RowCount { .. }
                | Self::DanglingSpend { .. }
                | Self::MissingBlock { .. }
                | Self::GenesisMismatch { .. }
        )
    }
}
