//! In-memory ledger backend.
//!
//! Keeps every relation in RAM. A transaction holds the ledger exclusively
//! and writes in place, logging the prior state of each row it changes.
//! Rolling back replays that log, so transactions are serialized and
//! uncommitted writes are never visible to other readers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use chainmirror_core::address::AddressKind;
use chainmirror_core::error::IndexerError;
use chainmirror_core::ledger::{
    BlockPresence, BlockRecord, Branch, BranchId, InputRecord, LedgerStore, LedgerTx,
    OutputRecord, RowId, StoredOutput, TransactionRecord,
};

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub id: RowId,
    pub record: BlockRecord,
    pub coinbase_sequence: Option<u32>,
    pub coinbase_script: Option<String>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRow {
    pub id: RowId,
    pub record: TransactionRecord,
    pub fee: Option<i64>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub id: RowId,
    pub tx_id: RowId,
    pub vout: u32,
    pub value: i64,
    pub req_sigs: Option<u32>,
    pub script_asm: String,
    pub script_hex: String,
    pub script_type: String,
    pub is_spent: bool,
    pub spent_by_input_id: Option<RowId>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    pub output_id: RowId,
    pub position: u32,
    pub address: String,
    pub kind: AddressKind,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    pub id: RowId,
    pub record: InputRecord,
    pub is_valid: bool,
}

/// Every relation of the ledger. Row identifiers are 1-based positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub branches: Vec<Branch>,
    pub blocks: Vec<BlockRow>,
    pub transactions: Vec<TransactionRow>,
    pub outputs: Vec<OutputRow>,
    pub addresses: Vec<AddressRow>,
    pub inputs: Vec<InputRow>,
}

impl LedgerSnapshot {
    fn next_id(len: usize) -> RowId {
        len as RowId + 1
    }

    /// Valid blocks at `height`; more than one is a broken ledger.
    pub fn valid_blocks_at(&self, height: u64) -> Vec<&BlockRow> {
        self.blocks
            .iter()
            .filter(|b| b.is_valid && b.record.height == height)
            .collect()
    }

    /// The valid transaction with `txid`, if any.
    pub fn valid_transaction(&self, txid: &str) -> Option<&TransactionRow> {
        self.transactions
            .iter()
            .find(|t| t.is_valid && t.record.txid == txid)
    }

    fn single_valid_block_at(&self, height: u64) -> Result<Option<&BlockRow>, IndexerError> {
        match self.valid_blocks_at(height).as_slice() {
            [] => Ok(None),
            [block] => Ok(Some(*block)),
            many => Err(IndexerError::row_count(
                format!("valid block at height {height}"),
                1,
                many.len() as u64,
            )),
        }
    }
}

// ─── MemoryLedger ─────────────────────────────────────────────────────────────

/// In-memory [`LedgerStore`]. Clones share the same ledger.
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerSnapshot>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// An empty ledger holding only the root branch.
    pub fn new() -> Self {
        let root = Branch {
            id: 1,
            fork_height: 0,
            parent_id: None,
            created_at: Utc::now().timestamp(),
        };
        Self {
            state: Arc::new(Mutex::new(LedgerSnapshot {
                branches: vec![root],
                ..Default::default()
            })),
        }
    }

    /// A copy of the committed ledger. Fails while a transaction is open.
    pub fn snapshot(&self) -> Result<LedgerSnapshot, IndexerError> {
        self.state
            .try_lock()
            .map(|state| state.clone())
            .map_err(|_| IndexerError::Store("memory ledger is held by an open transaction".into()))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    type Tx = MemoryLedgerTx;

    async fn begin(&self) -> Result<MemoryLedgerTx, IndexerError> {
        let state = Arc::clone(&self.state).lock_owned().await;
        let marks = Marks {
            branches: state.branches.len(),
            blocks: state.blocks.len(),
            transactions: state.transactions.len(),
            outputs: state.outputs.len(),
            addresses: state.addresses.len(),
            inputs: state.inputs.len(),
        };
        Ok(MemoryLedgerTx {
            state,
            marks,
            undo: Vec::new(),
            committed: false,
        })
    }
}

// ─── MemoryLedgerTx ───────────────────────────────────────────────────────────

/// Relation lengths when the transaction began. Rows past a mark were
/// appended by the transaction and are truncated on rollback.
#[derive(Debug, Clone, Copy)]
struct Marks {
    branches: usize,
    blocks: usize,
    transactions: usize,
    outputs: usize,
    addresses: usize,
    inputs: usize,
}

/// Prior state of a row that existed before the transaction touched it.
#[derive(Debug)]
enum Undo {
    Block(usize, BlockRow),
    Transaction(usize, TransactionRow),
    Output(usize, OutputRow),
    Address(usize, AddressRow),
    Input(usize, InputRow),
}

/// Row ids are 1-based positions.
fn row_index(id: RowId) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

/// Mutable access to `rows[index]`, logging its prior state if it predates
/// the transaction.
fn touch<'a, R: Clone>(
    rows: &'a mut [R],
    mark: usize,
    undo: &mut Vec<Undo>,
    wrap: fn(usize, R) -> Undo,
    index: usize,
) -> Option<&'a mut R> {
    let row = rows.get_mut(index)?;
    if index < mark {
        undo.push(wrap(index, row.clone()));
    }
    Some(row)
}

/// An open transaction on a [`MemoryLedger`].
///
/// Holds the ledger exclusively and writes in place. Rolling back, or
/// dropping the transaction without committing, replays the undo log and
/// truncates appended rows.
#[derive(Debug)]
pub struct MemoryLedgerTx {
    state: OwnedMutexGuard<LedgerSnapshot>,
    marks: Marks,
    undo: Vec<Undo>,
    committed: bool,
}

impl MemoryLedgerTx {
    fn revert(&mut self) {
        let state = &mut *self.state;
        for entry in self.undo.drain(..).rev() {
            match entry {
                Undo::Block(i, row) => state.blocks[i] = row,
                Undo::Transaction(i, row) => state.transactions[i] = row,
                Undo::Output(i, row) => state.outputs[i] = row,
                Undo::Address(i, row) => state.addresses[i] = row,
                Undo::Input(i, row) => state.inputs[i] = row,
            }
        }
        state.branches.truncate(self.marks.branches);
        state.blocks.truncate(self.marks.blocks);
        state.transactions.truncate(self.marks.transactions);
        state.outputs.truncate(self.marks.outputs);
        state.addresses.truncate(self.marks.addresses);
        state.inputs.truncate(self.marks.inputs);
    }
}

impl Drop for MemoryLedgerTx {
    fn drop(&mut self) {
        if !self.committed {
            self.revert();
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn block_presence(
        &mut self,
        height: u64,
        hash: &str,
    ) -> Result<BlockPresence, IndexerError> {
        Ok(match self.state.single_valid_block_at(height)? {
            None => BlockPresence::Missing,
            Some(block) if block.record.hash == hash => BlockPresence::Found,
            Some(block) => BlockPresence::Divergent {
                stored_hash: block.record.hash.clone(),
            },
        })
    }

    async fn best_height(&mut self) -> Result<Option<u64>, IndexerError> {
        Ok(self
            .state
            .blocks
            .iter()
            .filter(|b| b.is_valid)
            .map(|b| b.record.height)
            .max())
    }

    async fn block_hash_at(&mut self, height: u64) -> Result<Option<String>, IndexerError> {
        Ok(self
            .state
            .single_valid_block_at(height)?
            .map(|b| b.record.hash.clone()))
    }

    async fn branch_at(&mut self, height: u64) -> Result<Option<BranchId>, IndexerError> {
        Ok(self
            .state
            .single_valid_block_at(height)?
            .map(|b| b.record.branch_id))
    }

    async fn latest_branch(&mut self) -> Result<Option<Branch>, IndexerError> {
        Ok(self.state.branches.iter().max_by_key(|b| b.id).cloned())
    }

    async fn find_output(
        &mut self,
        txid: &str,
        vout: u32,
    ) -> Result<Option<StoredOutput>, IndexerError> {
        let state = &*self.state;
        let matches: Vec<&OutputRow> = state
            .transactions
            .iter()
            .filter(|t| t.is_valid && t.record.txid == txid)
            .flat_map(|t| {
                state
                    .outputs
                    .iter()
                    .filter(move |o| o.is_valid && o.tx_id == t.id && o.vout == vout)
            })
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [o] => Ok(Some(StoredOutput {
                id: o.id,
                value: o.value,
                is_spent: o.is_spent,
            })),
            many => Err(IndexerError::row_count(
                format!("find output {txid}:{vout}"),
                1,
                many.len() as u64,
            )),
        }
    }

    async fn insert_branch(
        &mut self,
        fork_height: u64,
        parent_id: Option<BranchId>,
        created_at: i64,
    ) -> Result<BranchId, IndexerError> {
        let id = self.state.branches.iter().map(|b| b.id).max().unwrap_or(0) + 1;
        self.state.branches.push(Branch {
            id,
            fork_height,
            parent_id,
            created_at,
        });
        Ok(id)
    }

    async fn insert_block(&mut self, block: &BlockRecord) -> Result<RowId, IndexerError> {
        // Same guarantee as the SQL backends' partial unique index.
        if !self.state.valid_blocks_at(block.height).is_empty() {
            return Err(IndexerError::Store(format!(
                "a valid block already exists at height {}",
                block.height
            )));
        }
        let id = LedgerSnapshot::next_id(self.state.blocks.len());
        self.state.blocks.push(BlockRow {
            id,
            record: block.clone(),
            coinbase_sequence: None,
            coinbase_script: None,
            is_valid: true,
        });
        Ok(id)
    }

    async fn set_block_coinbase(
        &mut self,
        block_id: RowId,
        sequence: u32,
        coinbase: &str,
    ) -> Result<(), IndexerError> {
        let valid = row_index(block_id)
            .and_then(|i| self.state.blocks.get(i).map(|b| (i, b.is_valid)))
            .filter(|(_, is_valid)| *is_valid);
        let Some((index, _)) = valid else {
            return Err(IndexerError::row_count(
                format!("set coinbase of block {block_id}"),
                1,
                0,
            ));
        };
        let blocks = &mut self.state.blocks;
        if let Some(row) = touch(blocks, self.marks.blocks, &mut self.undo, Undo::Block, index) {
            row.coinbase_sequence = Some(sequence);
            row.coinbase_script = Some(coinbase.to_string());
        }
        Ok(())
    }

    async fn insert_transaction(&mut self, tx: &TransactionRecord) -> Result<RowId, IndexerError> {
        let id = LedgerSnapshot::next_id(self.state.transactions.len());
        self.state.transactions.push(TransactionRow {
            id,
            record: tx.clone(),
            fee: None,
            is_valid: true,
        });
        Ok(id)
    }

    async fn set_transaction_fee(&mut self, tx_id: RowId, fee: i64) -> Result<(), IndexerError> {
        let valid = row_index(tx_id)
            .and_then(|i| self.state.transactions.get(i).map(|t| (i, t.is_valid)))
            .filter(|(_, is_valid)| *is_valid);
        let Some((index, _)) = valid else {
            return Err(IndexerError::row_count(format!("set fee of tx {tx_id}"), 1, 0));
        };
        let txs = &mut self.state.transactions;
        let mark = self.marks.transactions;
        if let Some(row) = touch(txs, mark, &mut self.undo, Undo::Transaction, index) {
            row.fee = Some(fee);
        }
        Ok(())
    }

    async fn insert_output(&mut self, output: &OutputRecord) -> Result<RowId, IndexerError> {
        let state = &mut *self.state;
        let id = LedgerSnapshot::next_id(state.outputs.len());
        state.outputs.push(OutputRow {
            id,
            tx_id: output.tx_id,
            vout: output.vout,
            value: output.value,
            req_sigs: output.req_sigs,
            script_asm: output.script_asm.clone(),
            script_hex: output.script_hex.clone(),
            script_type: output.script_type.clone(),
            is_spent: false,
            spent_by_input_id: None,
            is_valid: true,
        });
        for (position, addr) in output.addresses.iter().enumerate() {
            state.addresses.push(AddressRow {
                output_id: id,
                position: position as u32,
                address: addr.address.clone(),
                kind: addr.kind,
                is_valid: true,
            });
        }
        Ok(id)
    }

    async fn insert_input(&mut self, input: &InputRecord) -> Result<RowId, IndexerError> {
        let id = LedgerSnapshot::next_id(self.state.inputs.len());
        let spendable = row_index(input.output_id).filter(|&i| {
            self.state
                .outputs
                .get(i)
                .is_some_and(|o| o.is_valid && !o.is_spent)
        });
        let Some(index) = spendable else {
            return Err(IndexerError::row_count(
                format!("mark output {} spent", input.output_id),
                1,
                0,
            ));
        };

        let outputs = &mut self.state.outputs;
        let mark = self.marks.outputs;
        if let Some(row) = touch(outputs, mark, &mut self.undo, Undo::Output, index) {
            row.is_spent = true;
            row.spent_by_input_id = Some(id);
        }
        self.state.inputs.push(InputRow {
            id,
            record: input.clone(),
            is_valid: true,
        });
        Ok(id)
    }

    async fn invalidate_above(&mut self, height: u64) -> Result<u64, IndexerError> {
        let marks = self.marks;
        let undo = &mut self.undo;
        let state = &mut *self.state;

        let blocks: HashSet<RowId> = state
            .blocks
            .iter()
            .filter(|b| b.is_valid && b.record.height > height)
            .map(|b| b.id)
            .collect();
        let txs: HashSet<RowId> = state
            .transactions
            .iter()
            .filter(|t| t.is_valid && blocks.contains(&t.record.block_id))
            .map(|t| t.id)
            .collect();
        let inputs: HashSet<RowId> = state
            .inputs
            .iter()
            .filter(|i| i.is_valid && txs.contains(&i.record.tx_id))
            .map(|i| i.id)
            .collect();

        let mut dead_outputs = HashSet::new();
        for index in 0..state.outputs.len() {
            let output = &state.outputs[index];
            if !output.is_valid {
                continue;
            }
            let reopen = output.spent_by_input_id.is_some_and(|id| inputs.contains(&id));
            let dead = txs.contains(&output.tx_id);
            if !reopen && !dead {
                continue;
            }
            if let Some(row) = touch(&mut state.outputs, marks.outputs, undo, Undo::Output, index) {
                if reopen {
                    row.is_spent = false;
                    row.spent_by_input_id = None;
                }
                if dead {
                    row.is_valid = false;
                    dead_outputs.insert(row.id);
                }
            }
        }
        for index in 0..state.addresses.len() {
            let addr = &state.addresses[index];
            if addr.is_valid && dead_outputs.contains(&addr.output_id) {
                let rows = &mut state.addresses;
                if let Some(row) = touch(rows, marks.addresses, undo, Undo::Address, index) {
                    row.is_valid = false;
                }
            }
        }
        for index in 0..state.inputs.len() {
            if inputs.contains(&state.inputs[index].id) {
                let rows = &mut state.inputs;
                if let Some(row) = touch(rows, marks.inputs, undo, Undo::Input, index) {
                    row.is_valid = false;
                }
            }
        }
        for index in 0..state.transactions.len() {
            if txs.contains(&state.transactions[index].id) {
                let rows = &mut state.transactions;
                let mark = marks.transactions;
                if let Some(row) = touch(rows, mark, undo, Undo::Transaction, index) {
                    row.is_valid = false;
                }
            }
        }
        for index in 0..state.blocks.len() {
            if blocks.contains(&state.blocks[index].id) {
                let rows = &mut state.blocks;
                if let Some(row) = touch(rows, marks.blocks, undo, Undo::Block, index) {
                    row.is_valid = false;
                }
            }
        }

        tracing::debug!(height, blocks = blocks.len(), txs = txs.len(), "Invalidated blocks");
        Ok(blocks.len() as u64)
    }

    async fn commit(mut self) -> Result<(), IndexerError> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(self) -> Result<(), IndexerError> {
        // dropping replays the undo log
        Ok(())
    }
}
