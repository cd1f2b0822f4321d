//! SQLite ledger backend.
//!
//! Persists the ledger to a single SQLite file through `sqlx`. Each
//! [`LedgerTx`] wraps one `sqlx` transaction, so a block import is atomic.
//!
//! # Usage
//! ```rust,no_run
//! use chainmirror_storage::sqlite::SqliteLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteLedger::open("./ledger.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteLedger::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use chainmirror_core::error::IndexerError;
use chainmirror_core::ledger::{
    BlockPresence, BlockRecord, Branch, BranchId, InputRecord, LedgerStore, LedgerTx,
    OutputRecord, RowId, StoredOutput, TransactionRecord,
};

fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Store(e.to_string())
}

fn expect_one(operation: String, affected: u64) -> Result<(), IndexerError> {
    if affected != 1 {
        return Err(IndexerError::row_count(operation, 1, affected));
    }
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS branches (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        fork_height INTEGER NOT NULL,
        parent_id   INTEGER REFERENCES branches (id),
        created_at  INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blocks (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        branch_id         INTEGER NOT NULL REFERENCES branches (id),
        hash              TEXT    NOT NULL,
        height            INTEGER NOT NULL,
        size              INTEGER NOT NULL,
        stripped_size     INTEGER NOT NULL,
        weight            INTEGER NOT NULL,
        version           INTEGER NOT NULL,
        version_hex       TEXT    NOT NULL,
        merkle_root       TEXT    NOT NULL,
        time              INTEGER NOT NULL,
        median_time       INTEGER NOT NULL,
        nonce             INTEGER NOT NULL,
        bits              TEXT    NOT NULL,
        difficulty        REAL    NOT NULL,
        chainwork         TEXT    NOT NULL,
        tx_count          INTEGER NOT NULL,
        previous_hash     TEXT,
        coinbase_sequence INTEGER,
        coinbase_script   TEXT,
        is_valid          BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS blocks_valid_height ON blocks (height) WHERE is_valid",
    "CREATE INDEX IF NOT EXISTS blocks_hash ON blocks (hash)",
    "CREATE TABLE IF NOT EXISTS transactions (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        block_id    INTEGER NOT NULL REFERENCES blocks (id),
        txid        TEXT    NOT NULL,
        hash        TEXT    NOT NULL,
        size        INTEGER NOT NULL,
        vsize       INTEGER NOT NULL,
        weight      INTEGER NOT NULL,
        version     INTEGER NOT NULL,
        locktime    INTEGER NOT NULL,
        hex         TEXT    NOT NULL,
        is_coinbase BOOLEAN NOT NULL,
        fee         INTEGER,
        is_valid    BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS transactions_txid ON transactions (txid)",
    "CREATE INDEX IF NOT EXISTS transactions_block ON transactions (block_id)",
    "CREATE TABLE IF NOT EXISTS outputs (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        tx_id             INTEGER NOT NULL REFERENCES transactions (id),
        vout              INTEGER NOT NULL,
        value             INTEGER NOT NULL,
        req_sigs          INTEGER,
        script_asm        TEXT    NOT NULL,
        script_hex        TEXT    NOT NULL,
        script_type       TEXT    NOT NULL,
        is_spent          BOOLEAN NOT NULL DEFAULT FALSE,
        spent_by_input_id INTEGER,
        is_valid          BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS outputs_tx_vout ON outputs (tx_id, vout)",
    "CREATE INDEX IF NOT EXISTS outputs_spent_by ON outputs (spent_by_input_id)",
    "CREATE TABLE IF NOT EXISTS output_addresses (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        output_id    INTEGER NOT NULL REFERENCES outputs (id),
        position     INTEGER NOT NULL,
        address      TEXT    NOT NULL,
        address_type TEXT    NOT NULL,
        is_valid     BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS output_addresses_address ON output_addresses (address)",
    "CREATE INDEX IF NOT EXISTS output_addresses_output ON output_addresses (output_id)",
    "CREATE TABLE IF NOT EXISTS inputs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        tx_id       INTEGER NOT NULL REFERENCES transactions (id),
        vin         INTEGER NOT NULL,
        output_id   INTEGER NOT NULL REFERENCES outputs (id),
        spent_value INTEGER NOT NULL,
        sequence    INTEGER NOT NULL,
        script_asm  TEXT,
        script_hex  TEXT,
        witness     TEXT    NOT NULL,
        is_valid    BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS inputs_tx ON inputs (tx_id)",
];

/// SQLite-backed [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(db_err)?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool is pinned to one connection that never expires, since every
    /// new connection would see a fresh empty database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create relations and indexes, then seed the root branch if the
    /// branch relation is empty.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }

        let seeded = sqlx::query(
            "INSERT INTO branches (fork_height, parent_id, created_at)
             SELECT 0, NULL, ? WHERE NOT EXISTS (SELECT 1 FROM branches)",
        )
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if seeded.rows_affected() > 0 {
            debug!("seeded root branch");
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    type Tx = SqliteLedgerTx;

    async fn begin(&self) -> Result<SqliteLedgerTx, IndexerError> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(SqliteLedgerTx { tx })
    }
}

/// An open transaction on a [`SqliteLedger`].
pub struct SqliteLedgerTx {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteLedgerTx {
    async fn valid_block_at(
        &mut self,
        height: u64,
    ) -> Result<Option<(String, BranchId)>, IndexerError> {
        let sql = "SELECT hash, branch_id FROM blocks WHERE is_valid AND height = ?";
        let rows = sqlx::query(sql)
            .bind(height as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some((
                row.try_get("hash").map_err(db_err)?,
                row.try_get("branch_id").map_err(db_err)?,
            ))),
            many => Err(IndexerError::row_count(
                format!("valid block at height {height}"),
                1,
                many.len() as u64,
            )),
        }
    }
}

#[async_trait]
impl LedgerTx for SqliteLedgerTx {
    async fn block_presence(
        &mut self,
        height: u64,
        hash: &str,
    ) -> Result<BlockPresence, IndexerError> {
        Ok(match self.valid_block_at(height).await? {
            None => BlockPresence::Missing,
            Some((stored, _)) if stored == hash => BlockPresence::Found,
            Some((stored_hash, _)) => BlockPresence::Divergent { stored_hash },
        })
    }

    async fn best_height(&mut self) -> Result<Option<u64>, IndexerError> {
        let sql = "SELECT MAX(height) FROM blocks WHERE is_valid";
        let height: Option<i64> = sqlx::query_scalar(sql)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(height.map(|h| h as u64))
    }

    async fn block_hash_at(&mut self, height: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.valid_block_at(height).await?.map(|(hash, _)| hash))
    }

    async fn branch_at(&mut self, height: u64) -> Result<Option<BranchId>, IndexerError> {
        Ok(self.valid_block_at(height).await?.map(|(_, branch)| branch))
    }

    async fn latest_branch(&mut self) -> Result<Option<Branch>, IndexerError> {
        let row = sqlx::query(
            "SELECT id, fork_height, parent_id, created_at FROM branches ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(|r| -> Result<Branch, sqlx::Error> {
            Ok(Branch {
                id: r.try_get("id")?,
                fork_height: r.try_get::<i64, _>("fork_height")? as u64,
                parent_id: r.try_get("parent_id")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(db_err)
    }

    async fn find_output(
        &mut self,
        txid: &str,
        vout: u32,
    ) -> Result<Option<StoredOutput>, IndexerError> {
        let rows = sqlx::query(
            "SELECT o.id, o.value, o.is_spent
             FROM outputs o JOIN transactions t ON t.id = o.tx_id
             WHERE t.txid = ? AND o.vout = ? AND o.is_valid AND t.is_valid",
        )
        .bind(txid)
        .bind(vout as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(StoredOutput {
                id: row.try_get("id").map_err(db_err)?,
                value: row.try_get("value").map_err(db_err)?,
                is_spent: row.try_get("is_spent").map_err(db_err)?,
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
        sqlx::query_scalar::<_, BranchId>(
            "INSERT INTO branches (fork_height, parent_id, created_at)
             VALUES (?, ?, ?) RETURNING id",
        )
        .bind(fork_height as i64)
        .bind(parent_id)
        .bind(created_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| IndexerError::Store("branch insert returned no id".into()))
    }

    async fn insert_block(&mut self, b: &BlockRecord) -> Result<RowId, IndexerError> {
        sqlx::query_scalar::<_, RowId>(
            "INSERT INTO blocks (branch_id, hash, height, size, stripped_size, weight, version,
                version_hex, merkle_root, time, median_time, nonce, bits, difficulty, chainwork,
                tx_count, previous_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(b.branch_id)
        .bind(&b.hash)
        .bind(b.height as i64)
        .bind(b.size as i64)
        .bind(b.stripped_size as i64)
        .bind(b.weight as i64)
        .bind(b.version)
        .bind(&b.version_hex)
        .bind(&b.merkle_root)
        .bind(b.time)
        .bind(b.median_time)
        .bind(b.nonce as i64)
        .bind(&b.bits)
        .bind(b.difficulty)
        .bind(&b.chainwork)
        .bind(b.tx_count as i64)
        .bind(&b.previous_hash)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn set_block_coinbase(
        &mut self,
        block_id: RowId,
        sequence: u32,
        coinbase: &str,
    ) -> Result<(), IndexerError> {
        let done = sqlx::query(
            "UPDATE blocks SET coinbase_sequence = ?, coinbase_script = ?
             WHERE id = ? AND is_valid",
        )
        .bind(sequence as i64)
        .bind(coinbase)
        .bind(block_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        expect_one(format!("set coinbase of block {block_id}"), done.rows_affected())
    }

    async fn insert_transaction(&mut self, t: &TransactionRecord) -> Result<RowId, IndexerError> {
        sqlx::query_scalar::<_, RowId>(
            "INSERT INTO transactions (block_id, txid, hash, size, vsize, weight, version,
                locktime, hex, is_coinbase)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(t.block_id)
        .bind(&t.txid)
        .bind(&t.hash)
        .bind(t.size as i64)
        .bind(t.vsize as i64)
        .bind(t.weight as i64)
        .bind(t.version)
        .bind(t.locktime as i64)
        .bind(&t.hex)
        .bind(t.is_coinbase)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn set_transaction_fee(&mut self, tx_id: RowId, fee: i64) -> Result<(), IndexerError> {
        let done = sqlx::query("UPDATE transactions SET fee = ? WHERE id = ? AND is_valid")
            .bind(fee)
            .bind(tx_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        expect_one(format!("set fee of tx {tx_id}"), done.rows_affected())
    }

    async fn insert_output(&mut self, o: &OutputRecord) -> Result<RowId, IndexerError> {
        let id: RowId = sqlx::query_scalar(
            "INSERT INTO outputs (tx_id, vout, value, req_sigs, script_asm, script_hex, script_type)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(o.tx_id)
        .bind(o.vout as i64)
        .bind(o.value)
        .bind(o.req_sigs.map(i64::from))
        .bind(&o.script_asm)
        .bind(&o.script_hex)
        .bind(&o.script_type)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        for (position, addr) in o.addresses.iter().enumerate() {
            sqlx::query(
                "INSERT INTO output_addresses (output_id, position, address, address_type)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(&addr.address)
            .bind(addr.kind.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        }
        Ok(id)
    }

    async fn insert_input(&mut self, i: &InputRecord) -> Result<RowId, IndexerError> {
        let witness = serde_json::to_string(&i.witness)
            .map_err(|e| IndexerError::Store(format!("encode witness: {e}")))?;
        let id: RowId = sqlx::query_scalar(
            "INSERT INTO inputs (tx_id, vin, output_id, spent_value, sequence, script_asm,
                script_hex, witness)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(i.tx_id)
        .bind(i.vin as i64)
        .bind(i.output_id)
        .bind(i.spent_value)
        .bind(i.sequence as i64)
        .bind(&i.script_asm)
        .bind(&i.script_hex)
        .bind(&witness)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let done = sqlx::query(
            "UPDATE outputs SET is_spent = TRUE, spent_by_input_id = ?
             WHERE id = ? AND is_valid AND NOT is_spent",
        )
        .bind(id)
        .bind(i.output_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        expect_one(format!("mark output {} spent", i.output_id), done.rows_affected())?;
        Ok(id)
    }

    async fn invalidate_above(&mut self, height: u64) -> Result<u64, IndexerError> {
        let height = height as i64;
        let statements = [
            "UPDATE outputs SET is_spent = FALSE, spent_by_input_id = NULL
             WHERE is_valid AND spent_by_input_id IN (
                SELECT i.id FROM inputs i
                JOIN transactions t ON t.id = i.tx_id
                JOIN blocks b ON b.id = t.block_id
                WHERE i.is_valid AND b.is_valid AND b.height > ?)",
            "UPDATE output_addresses SET is_valid = FALSE
             WHERE is_valid AND output_id IN (
                SELECT o.id FROM outputs o
                JOIN transactions t ON t.id = o.tx_id
                JOIN blocks b ON b.id = t.block_id
                WHERE b.is_valid AND b.height > ?)",
            "UPDATE outputs SET is_valid = FALSE
             WHERE is_valid AND tx_id IN (
                SELECT t.id FROM transactions t JOIN blocks b ON b.id = t.block_id
                WHERE b.is_valid AND b.height > ?)",
            "UPDATE inputs SET is_valid = FALSE
             WHERE is_valid AND tx_id IN (
                SELECT t.id FROM transactions t JOIN blocks b ON b.id = t.block_id
                WHERE b.is_valid AND b.height > ?)",
            "UPDATE transactions SET is_valid = FALSE
             WHERE is_valid AND block_id IN (SELECT id FROM blocks WHERE is_valid AND height > ?)",
        ];
        for statement in statements {
            sqlx::query(statement)
                .bind(height)
                .execute(&mut *self.tx)
                .await
                .map_err(db_err)?;
        }

        let blocks = sqlx::query("UPDATE blocks SET is_valid = FALSE WHERE is_valid AND height > ?")
            .bind(height)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        debug!(height, blocks, "invalidated blocks");
        Ok(blocks)
    }

    async fn commit(self) -> Result<(), IndexerError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self) -> Result<(), IndexerError> {
        self.tx.rollback().await.map_err(db_err)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
