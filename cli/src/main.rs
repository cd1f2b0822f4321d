//! ChainMirror CLI: mirror a bitcoind chain into a relational ledger.
//!
//! # Commands
//! ```text
//! chainmirror [--config chainmirror.yaml] run
//! chainmirror [--config chainmirror.yaml] sync [--from <height>]
//! chainmirror [--config chainmirror.yaml] status
//! ```
//!
//! The ledger backend is picked from `database.url`: `postgres://…`,
//! `memory`, or anything else as a SQLite path/URL.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chainmirror_core::{
    ChainNetwork, ChainSource, IndexerError, LedgerStore, LedgerTx, SyncConfig, SyncEngine,
};
use chainmirror_rpc::{BitcoindSource, HttpRpcClient};
use chainmirror_storage::postgres::{PostgresLedger, PostgresOptions};
use chainmirror_storage::sqlite::SqliteLedger;
use chainmirror_storage::MemoryLedger;

mod config;
mod logging;

use config::AppConfig;

#[derive(Parser)]
#[command(
    name = "chainmirror",
    about = "Reorg-aware replication of a Bitcoin node into SQLite or PostgreSQL",
    long_about = "
ChainMirror polls a bitcoind node over JSON-RPC and mirrors every block,
transaction, input and output into a relational ledger, keeping a branch
history of every reorganization it resolves.

ENVIRONMENT VARIABLES:
  CHAINMIRROR_CONFIG         Path to the YAML config file
  CHAINMIRROR_RPC_URL        Node JSON-RPC endpoint
  CHAINMIRROR_RPC_USER       RPC user
  CHAINMIRROR_RPC_PASSWORD   RPC password
  CHAINMIRROR_DATABASE_URL   postgres://…, sqlite:… or memory
  RUST_LOG                   Log filter, overrides the config file
",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "CHAINMIRROR_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "CHAINMIRROR_RPC_URL")]
    rpc_url: Option<String>,

    #[arg(long, global = true, env = "CHAINMIRROR_RPC_USER")]
    rpc_user: Option<String>,

    #[arg(long, global = true, env = "CHAINMIRROR_RPC_PASSWORD", hide_env_values = true)]
    rpc_password: Option<String>,

    #[arg(long, global = true, env = "CHAINMIRROR_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(url) = &self.rpc_url {
            config.rpc.url = url.clone();
        }
        if let Some(user) = &self.rpc_user {
            config.rpc.user = Some(user.clone());
        }
        if let Some(password) = &self.rpc_password {
            config.rpc.password = Some(password.clone());
        }
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the node forever, stopping on Ctrl-C
    Run,

    /// Run a single sync pass and exit
    Sync {
        /// Height to start from instead of the store's best height
        #[arg(long)]
        from: Option<u64>,
    },

    /// Show node height, stored height and current branch
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    logging::init_tracing(&config.log);

    let client = HttpRpcClient::new(config.rpc.url.clone(), config.rpc.client_config())
        .context("building RPC client")?;
    let chain = BitcoindSource::new(client);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let startup = Startup::for_command(&cli.command, &config.sync);

    let url = config.database.url.clone();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let options = PostgresOptions {
            max_connections: config.database.max_connections,
            ..PostgresOptions::default()
        };
        let connect = || PostgresLedger::connect_with_options(&url, options.clone());
        let what = "connecting to PostgreSQL ledger";
        let Some(store) = startup.step(what, shutdown.as_mut(), connect).await? else {
            return Ok(());
        };
        execute(cli.command, chain, store, &config, startup, shutdown).await
    } else if url == "memory" {
        tracing::warn!("Using the in-memory ledger, nothing will be persisted");
        let store = MemoryLedger::new();
        execute(cli.command, chain, store, &config, startup, shutdown).await
    } else {
        let what = format!("opening SQLite ledger {url}");
        let open = || SqliteLedger::open(&url);
        let Some(store) = startup.step(&what, shutdown.as_mut(), open).await? else {
            return Ok(());
        };
        execute(cli.command, chain, store, &config, startup, shutdown).await
    }
}

// ─── Startup ─────────────────────────────────────────────────────────────────

/// How startup steps (store connection, network detection) treat failures.
///
/// `run` is a long-lived driver: a node or database that is still coming up
/// is waited for, every `interval`, until shutdown. One-shot commands fail
/// fast so their exit status reflects the error.
#[derive(Debug, Clone, Copy)]
struct Startup {
    retry: bool,
    interval: Duration,
}

impl Startup {
    fn for_command(command: &Commands, sync: &SyncConfig) -> Self {
        Self {
            retry: matches!(command, Commands::Run),
            interval: Duration::from_millis(sync.poll_interval_ms),
        }
    }

    /// Run `attempt` until it succeeds. Returns `Ok(None)` if `shutdown`
    /// resolves while waiting to retry.
    async fn step<T, F, Fut, D>(
        &self,
        what: &str,
        mut shutdown: Pin<&mut D>,
        mut attempt: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
        D: Future<Output = ()>,
    {
        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) => e,
            };
            if !self.retry || !err.is_transient() {
                return Err(anyhow::Error::new(err).context(what.to_string()));
            }
            tracing::warn!(
                error = %err,
                retry_in_ms = self.interval.as_millis() as u64,
                "{what} failed, retrying"
            );
            tokio::select! {
                () = shutdown.as_mut() => {
                    tracing::info!("Shutdown requested during startup");
                    return Ok(None);
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn execute<C, S, D>(
    command: Commands,
    chain: C,
    store: S,
    config: &AppConfig,
    startup: Startup,
    mut shutdown: Pin<&mut D>,
) -> Result<()>
where
    C: ChainSource,
    S: LedgerStore,
    D: Future<Output = ()>,
{
    match command {
        Commands::Run => {
            let node = &chain;
            let query = || node.chain_name();
            let what = "querying the node's chain";
            let Some(name) = startup.step(what, shutdown.as_mut(), query).await? else {
                return Ok(());
            };
            let network =
                ChainNetwork::from_chain_name(&name).context("detecting the node's network")?;
            tracing::info!(%network, "Detected chain");

            let mut engine = SyncEngine::new(chain, store, config.sync.clone(), network);
            engine.run(shutdown).await;
            Ok(())
        }
        Commands::Sync { from } => {
            let mut engine = SyncEngine::detect(chain, store, config.sync.clone())
                .await
                .context("detecting the node's network")?;
            let report = engine
                .sync_once(from.or(config.sync.start_height))
                .await
                .context("sync pass failed")?;

            println!(
                "imported {} block(s), {} transaction(s); skipped {}; limit {}",
                report.imported,
                report.transactions,
                report.skipped,
                report.limit.map_or_else(|| "-".to_string(), |l| l.to_string()),
            );
            for event in &report.reorgs {
                println!(
                    "reorg at {}: ancestor {} (depth {}), branch {} from {}, \
                     {} block(s) invalidated",
                    event.detected_at,
                    event.ancestor,
                    event.depth(),
                    event.branch,
                    event.parent_branch,
                    event.invalidated,
                );
            }
            Ok(())
        }
        Commands::Status => status(&chain, &store).await,
    }
}

async fn status<C: ChainSource, S: LedgerStore>(chain: &C, store: &S) -> Result<()> {
    let network = chain.chain_name().await.context("querying node")?;
    let node_height = chain.block_count().await.context("querying node")?;

    let mut tx = store.begin().await?;
    let stored = tx.best_height().await;
    let branch = tx.latest_branch().await;
    tx.rollback().await?;
    let (stored, branch) = (stored?, branch?);

    println!("network:      {network}");
    println!("node height:  {node_height}");
    match stored {
        Some(height) => {
            let behind = node_height.saturating_sub(height);
            println!("store height: {height} ({behind} behind)");
        }
        None => println!("store height: - (empty)"),
    }
    match branch {
        Some(b) => println!(
            "branch:       {} (fork height {}, parent {})",
            b.id,
            b.fork_height,
            b.parent_id.map_or_else(|| "-".to_string(), |p| p.to_string()),
        ),
        None => println!("branch:       - (no root branch)"),
    }
    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
