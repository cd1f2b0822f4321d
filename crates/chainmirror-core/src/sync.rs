//! The sync engine: walks the node's chain forward one height at a time,
//! hands divergence to the reorg resolver and resumes from the ancestor.
//!
//! # Pass structure
//!
//! ```text
//! sync_once(start)
//!   loop:
//!     pass(from)                      heights from..=limit, one transaction each
//!       ├── Found      → skip
//!       ├── Missing    → fetch block, check parent link, import, commit
//!       │                 (parent ≠ stored block at height-1 → Divergent there)
//!       └── Divergent  → commit (empty), stop the pass
//!     Divergent? → ReorgResolver::resolve → from = ancestor, loop again
//! ```
//!
//! A divergence at height 0 cannot be resolved and ends the call with
//! [`IndexerError::GenesisMismatch`].
//!
//! [`SyncEngine::run`] is the outer driver: it repeats passes forever,
//! sleeping between them, until the shutdown future completes.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{AddressClassifier, ChainNetwork};
use crate::branch::BranchManager;
use crate::chain::ChainSource;
use crate::config::SyncConfig;
use crate::error::IndexerError;
use crate::importer::{BlockImporter, ImportStats};
use crate::ledger::{BlockPresence, LedgerStore, LedgerTx};
use crate::reorg::{ReorgEvent, ReorgResolver};

/// Runtime state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Between passes.
    Idle,
    /// Importing the block at `height`.
    Syncing { height: u64 },
    /// Resolving a divergence first seen at `detected_at`.
    Reorging { detected_at: u64 },
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing { height } => write!(f, "syncing({height})"),
            Self::Reorging { detected_at } => write!(f, "reorging({detected_at})"),
        }
    }
}

/// Outcome of one [`SyncEngine::sync_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Blocks imported, across all resumed passes.
    pub imported: u64,
    /// Heights whose block was already stored.
    pub skipped: u64,
    /// Transactions written by the imported blocks.
    pub transactions: u64,
    /// Highest height the last pass was allowed to import.
    pub limit: Option<u64>,
    pub reorgs: Vec<ReorgEvent>,
}

impl SyncReport {
    fn record(&mut self, stats: &ImportStats) {
        self.imported += 1;
        self.transactions += stats.transactions;
    }
}

enum PassOutcome {
    Complete,
    Diverged { height: u64, stored: String, live: String },
}

enum HeightOutcome {
    Imported(ImportStats),
    Skipped,
    /// The stored block at `height` is not on the node's chain.
    Diverged {
        height: u64,
        stored: String,
        live: String,
    },
}

/// Mirrors a [`ChainSource`] into a [`LedgerStore`].
pub struct SyncEngine<C: ChainSource, S: LedgerStore> {
    chain: C,
    store: S,
    config: SyncConfig,
    branches: BranchManager,
    importer: BlockImporter,
    resolver: ReorgResolver,
    state: SyncState,
}

impl<C: ChainSource, S: LedgerStore> SyncEngine<C, S> {
    pub fn new(chain: C, store: S, config: SyncConfig, network: ChainNetwork) -> Self {
        Self {
            chain,
            store,
            config,
            branches: BranchManager::new(),
            importer: BlockImporter::new(AddressClassifier::new(network)),
            resolver: ReorgResolver::new(),
            state: SyncState::Idle,
        }
    }

    /// Ask the node which chain it serves and build an engine for it.
    pub async fn detect(chain: C, store: S, config: SyncConfig) -> Result<Self, IndexerError> {
        let name = chain.chain_name().await?;
        let network = ChainNetwork::from_chain_name(&name)?;
        tracing::info!(%network, "Detected chain");
        Ok(Self::new(chain, store, config, network))
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn network(&self) -> ChainNetwork {
        self.importer.classifier().network()
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    /// Run passes until the chain is mirrored up to the confirmation limit.
    ///
    /// `start` overrides the store's best height for the first pass only.
    /// Each detected divergence is resolved and the pass resumes from the
    /// common ancestor, so one call may cover several reorgs.
    pub async fn sync_once(&mut self, start: Option<u64>) -> Result<SyncReport, IndexerError> {
        let mut report = SyncReport::default();
        let mut from = start;

        let result = loop {
            match self.pass(from, &mut report).await {
                Ok(PassOutcome::Complete) => break Ok(()),
                Ok(PassOutcome::Diverged { height: 0, stored, live }) => {
                    break Err(IndexerError::GenesisMismatch { stored, live });
                }
                Ok(PassOutcome::Diverged { height, .. }) => {
                    self.state = SyncState::Reorging {
                        detected_at: height,
                    };
                    match self
                        .resolver
                        .resolve(&self.chain, &self.store, &mut self.branches, height)
                        .await
                    {
                        Ok(event) => {
                            from = Some(event.ancestor);
                            report.reorgs.push(event);
                        }
                        Err(e) => break Err(e),
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.state = SyncState::Idle;
        match result {
            Ok(()) => Ok(report),
            Err(e) => {
                self.branches.forget();
                Err(e)
            }
        }
    }

    /// Repeat [`sync_once`](Self::sync_once) until `shutdown` completes,
    /// sleeping `poll_interval_ms` between passes.
    ///
    /// Failed passes are logged and retried on the next tick. The configured
    /// `start_height` applies to the first pass only.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut start = self.config.start_height;

        tracing::info!(
            network = %self.network(),
            min_confirmations = self.config.min_confirmations,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting sync loop"
        );

        loop {
            match self.sync_once(start.take()).await {
                Ok(report) if report.imported > 0 || !report.reorgs.is_empty() => {
                    tracing::info!(
                        imported = report.imported,
                        skipped = report.skipped,
                        reorgs = report.reorgs.len(),
                        limit = ?report.limit,
                        "Sync pass complete"
                    );
                }
                Ok(report) => {
                    tracing::debug!(limit = ?report.limit, "Up to date");
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Sync pass failed, retrying");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Sync pass aborted on inconsistent data, retrying");
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping sync loop");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn pass(
        &mut self,
        from: Option<u64>,
        report: &mut SyncReport,
    ) -> Result<PassOutcome, IndexerError> {
        let db_height = match from {
            Some(height) => height,
            None => self.stored_height().await?,
        };
        let chain_height = self.chain.block_count().await?;
        let limit = self.config.import_limit(chain_height);
        report.limit = Some(limit);

        if db_height > limit {
            tracing::debug!(db_height, limit, "Nothing to import");
            return Ok(PassOutcome::Complete);
        }
        tracing::debug!(from = db_height, limit, chain_height, "Starting pass");

        for height in db_height..=limit {
            self.state = SyncState::Syncing { height };
            match self.sync_height(height).await? {
                HeightOutcome::Imported(stats) => report.record(&stats),
                HeightOutcome::Skipped => report.skipped += 1,
                HeightOutcome::Diverged { height, stored, live } => {
                    return Ok(PassOutcome::Diverged { height, stored, live })
                }
            }
        }
        Ok(PassOutcome::Complete)
    }

    /// Best valid height in the store, 0 for an empty store.
    async fn stored_height(&self) -> Result<u64, IndexerError> {
        let mut tx = self.store.begin().await?;
        let height = tx.best_height().await;
        tx.rollback().await?;
        Ok(height?.unwrap_or(0))
    }

    /// Process one height inside its own transaction.
    async fn sync_height(&mut self, height: u64) -> Result<HeightOutcome, IndexerError> {
        let mut tx = self.store.begin().await?;
        match self.check_and_import(&mut tx, height).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(height, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn check_and_import(
        &mut self,
        tx: &mut S::Tx,
        height: u64,
    ) -> Result<HeightOutcome, IndexerError> {
        let hash = self.chain.block_hash(height).await?;

        match tx.block_presence(height, &hash).await? {
            BlockPresence::Found => {
                tracing::debug!(height, %hash, "Block already stored");
                Ok(HeightOutcome::Skipped)
            }
            BlockPresence::Divergent { stored_hash } => {
                tracing::warn!(
                    height,
                    stored = %stored_hash,
                    live = %hash,
                    "Stored chain diverges from node"
                );
                Ok(HeightOutcome::Diverged {
                    height,
                    stored: stored_hash,
                    live: hash,
                })
            }
            BlockPresence::Missing => {
                let block = self.chain.block(&hash).await?;
                if block.height != height || block.hash != hash {
                    return Err(IndexerError::MalformedBlock {
                        height,
                        reason: format!(
                            "requested {hash}, node returned {} at height {}",
                            block.hash, block.height
                        ),
                    });
                }
                // The node may have reorged below `height` since the last pass.
                if let Some(parent) = self.stored_parent(tx, height).await? {
                    if block.previous_block_hash.as_deref() != Some(parent.as_str()) {
                        let live = block.previous_block_hash.unwrap_or_default();
                        tracing::warn!(
                            height = height - 1,
                            stored = %parent,
                            live = %live,
                            "Block does not extend the stored tip"
                        );
                        return Ok(HeightOutcome::Diverged {
                            height: height - 1,
                            stored: parent,
                            live,
                        });
                    }
                }
                let stats = self.importer.import(tx, &mut self.branches, &block).await?;
                tracing::info!(
                    height,
                    %hash,
                    txs = stats.transactions,
                    outputs = stats.outputs,
                    inputs = stats.inputs,
                    fees = stats.fees,
                    "Imported block"
                );
                Ok(HeightOutcome::Imported(stats))
            }
        }
    }

    /// Hash of the valid block stored just below `height`, if any.
    async fn stored_parent(
        &self,
        tx: &mut S::Tx,
        height: u64,
    ) -> Result<Option<String>, IndexerError> {
        match height.checked_sub(1) {
            Some(below) => tx.block_hash_at(below).await,
            None => Ok(None),
        }
    }
}
