//! chainmirror-storage: ledger store backends for ChainMirror.
//!
//! Backends:
//! - [`memory`]: in-memory (tests and dry runs, no persistence)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx` (production)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{LedgerSnapshot, MemoryLedger};
