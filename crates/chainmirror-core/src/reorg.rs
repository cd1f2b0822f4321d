//! Reorg recovery: locate the common ancestor of the stored and live chains,
//! open a new branch there and invalidate the orphaned suffix.
//!
//! The resolver is only entered after the sync engine saw a valid stored
//! block whose hash differs from the node's at the same height. It probes
//! backward one height at a time, so the cost is proportional to the depth
//! of the reorg.

use serde::{Deserialize, Serialize};

use crate::branch::BranchManager;
use crate::chain::ChainSource;
use crate::error::IndexerError;
use crate::ledger::{BranchId, LedgerStore, LedgerTx};

/// Describes a resolved chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    /// Height at which the stored and live hashes were first seen to differ.
    pub detected_at: u64,
    /// Highest height at which both chains still agree.
    pub ancestor: u64,
    /// The branch created for the live chain.
    pub branch: BranchId,
    /// Branch owning the ancestor block.
    pub parent_branch: BranchId,
    /// Number of stored blocks invalidated.
    pub invalidated: u64,
}

impl ReorgEvent {
    /// Number of stored blocks above the ancestor the divergence was seen at.
    pub fn depth(&self) -> u64 {
        self.detected_at.saturating_sub(self.ancestor)
    }
}

/// Finds fork points and rewrites branch history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReorgResolver;

impl ReorgResolver {
    pub fn new() -> Self {
        Self
    }

    /// Walk down from the store's best height until the stored and live
    /// hashes match.
    ///
    /// Probing starts no higher than the node's own tip, so a live chain
    /// that became shorter than the stored one is handled. Height 0 is
    /// returned even if the genesis hashes differ.
    pub async fn find_common_ancestor<C, T>(
        &self,
        chain: &C,
        tx: &mut T,
    ) -> Result<u64, IndexerError>
    where
        C: ChainSource + ?Sized,
        T: LedgerTx,
    {
        let stored_tip = tx
            .best_height()
            .await?
            .ok_or(IndexerError::MissingBlock { height: 0 })?;
        let mut height = stored_tip.min(chain.block_count().await?);

        loop {
            let stored = tx
                .block_hash_at(height)
                .await?
                .ok_or(IndexerError::MissingBlock { height })?;
            let live = chain.block_hash(height).await?;
            if stored == live {
                tracing::debug!(height, hash = %stored, "Found common ancestor");
                return Ok(height);
            }
            if height == 0 {
                tracing::warn!(
                    stored = %stored,
                    live = %live,
                    "Genesis hashes differ, treating genesis as common"
                );
                return Ok(0);
            }
            tracing::debug!(height, stored = %stored, live = %live, "Still diverged");
            height -= 1;
        }
    }

    /// Resolve a divergence seen at `detected_at`.
    ///
    /// Runs in a transaction of its own: the ancestor search, branch
    /// creation and invalidation either all commit or all roll back. On
    /// success the new branch becomes the tip and forward sync must resume
    /// from `ReorgEvent::ancestor`.
    pub async fn resolve<C, S>(
        &self,
        chain: &C,
        store: &S,
        branches: &mut BranchManager,
        detected_at: u64,
    ) -> Result<ReorgEvent, IndexerError>
    where
        C: ChainSource + ?Sized,
        S: LedgerStore,
    {
        let mut tx = store.begin().await?;
        match self.rewrite(chain, &mut tx, branches, detected_at).await {
            Ok(event) => {
                tx.commit().await?;
                branches.adopt(event.branch);
                tracing::warn!(
                    detected_at,
                    ancestor = event.ancestor,
                    depth = event.depth(),
                    branch = event.branch,
                    parent_branch = event.parent_branch,
                    invalidated = event.invalidated,
                    "Reorg resolved"
                );
                Ok(event)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed reorg failed");
                }
                Err(e)
            }
        }
    }

    async fn rewrite<C, T>(
        &self,
        chain: &C,
        tx: &mut T,
        branches: &BranchManager,
        detected_at: u64,
    ) -> Result<ReorgEvent, IndexerError>
    where
        C: ChainSource + ?Sized,
        T: LedgerTx,
    {
        let ancestor = self.find_common_ancestor(chain, tx).await?;
        let parent_branch = branches.branch_of(tx, ancestor).await?;
        let branch = branches.create_branch(tx, ancestor, parent_branch).await?;
        let invalidated = tx.invalidate_above(ancestor).await?;
        Ok(ReorgEvent {
            detected_at,
            ancestor,
            branch,
            parent_branch,
            invalidated,
        })
    }
}
