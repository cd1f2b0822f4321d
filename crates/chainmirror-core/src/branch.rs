//! Branch bookkeeping: which branch new blocks belong to, and creation of
//! new branches when the chain forks.

use chrono::Utc;

use crate::error::IndexerError;
use crate::ledger::{BranchId, LedgerTx};

/// Tracks the branch that currently holds the chain tip.
///
/// The tip is kept as process state: it is loaded once from the store (the
/// most recently created branch) and afterwards only moves when a reorg is
/// resolved. [`forget`](Self::forget) drops the cached value so the next
/// lookup reloads it.
#[derive(Debug, Default)]
pub struct BranchManager {
    tip: Option<BranchId>,
}

impl BranchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached tip branch, if one has been loaded or adopted.
    pub fn tip(&self) -> Option<BranchId> {
        self.tip
    }

    /// The branch new blocks are assigned to.
    ///
    /// Fails with [`IndexerError::Store`] if the store holds no branch at all,
    /// since the root branch is expected to exist from schema setup onward.
    pub async fn best_branch<T: LedgerTx>(&mut self, tx: &mut T) -> Result<BranchId, IndexerError> {
        if let Some(id) = self.tip {
            return Ok(id);
        }
        let branch = tx
            .latest_branch()
            .await?
            .ok_or_else(|| IndexerError::Store("no branch exists, root branch missing".into()))?;
        tracing::debug!(branch = branch.id, fork_height = branch.fork_height, "Loaded tip branch");
        self.tip = Some(branch.id);
        Ok(branch.id)
    }

    /// Persist a new branch forking from `parent_id` after `fork_height`.
    pub async fn create_branch<T: LedgerTx>(
        &self,
        tx: &mut T,
        fork_height: u64,
        parent_id: BranchId,
    ) -> Result<BranchId, IndexerError> {
        let id = tx
            .insert_branch(fork_height, Some(parent_id), Utc::now().timestamp())
            .await?;
        tracing::info!(branch = id, parent = parent_id, fork_height, "Created branch");
        Ok(id)
    }

    /// The branch owning the valid block at `height`.
    pub async fn branch_of<T: LedgerTx>(
        &self,
        tx: &mut T,
        height: u64,
    ) -> Result<BranchId, IndexerError> {
        tx.branch_at(height)
            .await?
            .ok_or(IndexerError::MissingBlock { height })
    }

    /// Make `id` the tip branch. Call only after the transaction that
    /// created it has committed.
    pub fn adopt(&mut self, id: BranchId) {
        self.tip = Some(id);
    }

    pub fn forget(&mut self) {
        self.tip = None;
    }
}
