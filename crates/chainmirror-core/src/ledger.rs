//! The ledger store abstraction: a relational mirror of the chain with
//! per-block transactional writes.
//!
//! Every operation runs on a [`LedgerTx`] obtained from
//! [`LedgerStore::begin`]. Nothing written through a transaction is visible
//! to other readers until [`LedgerTx::commit`]; [`LedgerTx::rollback`]
//! discards it entirely. Reads through a transaction see that transaction's
//! own uncommitted writes.
//!
//! Rows are never deleted. Reorgs flip the `is_valid` flag instead, and all
//! lookups below consider valid rows only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::AddressKind;
use crate::error::IndexerError;

/// Store-assigned identifier of a branch.
pub type BranchId = i64;

/// Store-assigned identifier of a block, transaction, output or input row.
pub type RowId = i64;

// ─── Records ──────────────────────────────────────────────────────────────────

/// One segment of chain history sharing lineage since its fork point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    /// Height of the last block shared with the parent branch.
    pub fork_height: u64,
    /// `None` only for the root branch.
    pub parent_id: Option<BranchId>,
    /// Unix timestamp of when the branch row was created.
    pub created_at: i64,
}

/// A block row to insert (always inserted valid).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub branch_id: BranchId,
    pub hash: String,
    pub height: u64,
    pub size: u64,
    pub stripped_size: u64,
    pub weight: u64,
    pub version: i32,
    pub version_hex: String,
    pub merkle_root: String,
    pub time: i64,
    pub median_time: i64,
    pub nonce: u64,
    pub bits: String,
    pub difficulty: f64,
    pub chainwork: String,
    pub tx_count: u32,
    pub previous_hash: Option<String>,
}

/// A transaction row to insert. The fee is written separately once all
/// inputs have been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub block_id: RowId,
    pub txid: String,
    pub hash: String,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    pub version: i32,
    pub locktime: u32,
    pub hex: String,
    pub is_coinbase: bool,
}

/// One address an output pays to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub kind: AddressKind,
}

/// An output row to insert (always unspent), with its address linkage rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub tx_id: RowId,
    pub vout: u32,
    /// Value in satoshis.
    pub value: i64,
    pub addresses: Vec<AddressRecord>,
    pub req_sigs: Option<u32>,
    pub script_asm: String,
    pub script_hex: String,
    pub script_type: String,
}

/// A non-coinbase input row to insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub tx_id: RowId,
    pub vin: u32,
    /// The output this input spends.
    pub output_id: RowId,
    /// Value of the spent output in satoshis, copied at import time.
    pub spent_value: i64,
    pub sequence: u32,
    pub script_asm: Option<String>,
    pub script_hex: Option<String>,
    pub witness: Vec<String>,
}

/// A valid output located by `(txid, vout)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredOutput {
    pub id: RowId,
    pub value: i64,
    pub is_spent: bool,
}

/// What the store holds at a height, compared to the chain's hash there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPresence {
    /// A valid block with exactly this hash is stored.
    Found,
    /// No valid block is stored at this height.
    Missing,
    /// A valid block with a different hash is stored: the chains diverge here.
    Divergent { stored_hash: String },
}

// ─── Traits ───────────────────────────────────────────────────────────────────

/// A relational store that hands out transactional units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Self::Tx, IndexerError>;
}

/// Point reads and writes inside one open transaction.
///
/// Every mutation meant to affect exactly one logical row fails with
/// [`IndexerError::RowCount`] when it affects any other number.
#[async_trait]
pub trait LedgerTx: Send + Sized {
    // ── Reads ──

    /// Compare the valid block stored at `height` against `hash`.
    async fn block_presence(
        &mut self,
        height: u64,
        hash: &str,
    ) -> Result<BlockPresence, IndexerError>;

    /// Greatest height with a valid block, `None` when no valid block exists.
    async fn best_height(&mut self) -> Result<Option<u64>, IndexerError>;

    /// Hash of the valid block at `height`.
    async fn block_hash_at(&mut self, height: u64) -> Result<Option<String>, IndexerError>;

    /// Branch of the valid block at `height`.
    async fn branch_at(&mut self, height: u64) -> Result<Option<BranchId>, IndexerError>;

    /// The branch with the greatest identifier.
    async fn latest_branch(&mut self) -> Result<Option<Branch>, IndexerError>;

    /// Locate the valid output `vout` of the valid transaction `txid`.
    async fn find_output(
        &mut self,
        txid: &str,
        vout: u32,
    ) -> Result<Option<StoredOutput>, IndexerError>;

    // ── Writes ──

    async fn insert_branch(
        &mut self,
        fork_height: u64,
        parent_id: Option<BranchId>,
        created_at: i64,
    ) -> Result<BranchId, IndexerError>;

    async fn insert_block(&mut self, block: &BlockRecord) -> Result<RowId, IndexerError>;

    /// Record the coinbase input's sequence and script on a valid block.
    async fn set_block_coinbase(
        &mut self,
        block_id: RowId,
        sequence: u32,
        coinbase: &str,
    ) -> Result<(), IndexerError>;

    async fn insert_transaction(&mut self, tx: &TransactionRecord) -> Result<RowId, IndexerError>;

    async fn set_transaction_fee(&mut self, tx_id: RowId, fee: i64) -> Result<(), IndexerError>;

    /// Insert an unspent output plus one linkage row per address.
    async fn insert_output(&mut self, output: &OutputRecord) -> Result<RowId, IndexerError>;

    /// Insert an input and mark the output it spends as spent by it.
    ///
    /// Fails with [`IndexerError::RowCount`] unless exactly one valid,
    /// still-unspent output was marked.
    async fn insert_input(&mut self, input: &InputRecord) -> Result<RowId, IndexerError>;

    /// Invalidate every block above `height`, together with its transactions,
    /// outputs, inputs and address rows. Valid outputs whose spending input
    /// is invalidated become unspent again. Returns the number of blocks
    /// invalidated.
    async fn invalidate_above(&mut self, height: u64) -> Result<u64, IndexerError>;

    // ── Boundary ──

    async fn commit(self) -> Result<(), IndexerError>;

    async fn rollback(self) -> Result<(), IndexerError>;
}
