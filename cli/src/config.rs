//! `chainmirror.yaml` loading.
//!
//! ```yaml
//! rpc:
//!   url: http://127.0.0.1:8332
//!   user: rpcuser
//!   password: rpcpass
//! database:
//!   url: postgres://mirror@localhost/chainmirror
//! sync:
//!   min_confirmations: 6
//! log:
//!   level: info
//!   components:
//!     chainmirror-rpc: debug
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use chainmirror_core::SyncConfig;
use chainmirror_rpc::{HttpClientConfig, RetryConfig};

use crate::logging::LogConfig;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rpc: RpcConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

/// Connection to the node's JSON-RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    /// Retries for connection-level failures, after the first attempt.
    pub max_retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".into(),
            user: None,
            password: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl RpcConfig {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            user: self.user.clone(),
            password: self.password.clone(),
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            },
            request_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Ledger store location: `postgres://…`, `sqlite:…` or `memory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    /// Pool size for PostgreSQL.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:chainmirror.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

impl AppConfig {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}
