//! chainmirror-core: reorg-aware replication of a Bitcoin node into a
//! relational ledger.
//!
//! # Architecture
//!
//! ```text
//! ChainSource ──► SyncEngine ──► LedgerStore (memory / SQLite / Postgres)
//!                     ├── BlockImporter    (block → block/tx/output/input rows)
//!                     │     └── AddressClassifier
//!                     ├── BranchManager    (tip branch, branch creation)
//!                     └── ReorgResolver    (common ancestor, invalidation)
//! ```
//!
//! Each height is imported inside one ledger transaction. A stored block
//! whose hash disagrees with the node is reported as
//! [`BlockPresence::Divergent`], upon which the resolver opens a new branch
//! at the common ancestor and the engine resumes from there.

pub mod address;
pub mod amount;
pub mod branch;
pub mod chain;
pub mod config;
pub mod error;
pub mod importer;
pub mod ledger;
pub mod reorg;
pub mod sync;
pub mod types;

pub use address::{AddressClassifier, AddressKind, ChainNetwork};
pub use branch::BranchManager;
pub use chain::{ChainSource, InMemoryChain};
pub use config::SyncConfig;
pub use error::IndexerError;
pub use importer::{BlockImporter, ImportStats};
pub use ledger::{BlockPresence, Branch, BranchId, LedgerStore, LedgerTx, RowId};
pub use reorg::{ReorgEvent, ReorgResolver};
pub use sync::{SyncEngine, SyncReport, SyncState};
pub use types::{ChainBlock, ChainInput, ChainOutput, ChainTransaction};
