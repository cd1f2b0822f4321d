//! Sync engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`SyncEngine`](crate::sync::SyncEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Blocks within this many confirmations of the node's tip are left
    /// unimported. `0` follows the tip exactly.
    pub min_confirmations: u64,
    /// Explicit height to start the first pass from. Later passes always
    /// resume from the store's best valid height.
    pub start_height: Option<u64>,
    /// Pause between passes of the outer driver (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_confirmations: 0,
            start_height: None,
            poll_interval_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Highest height a pass may import, given the node's tip.
    pub fn import_limit(&self, chain_height: u64) -> u64 {
        chain_height.saturating_sub(self.min_confirmations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_never_underflows() {
        let config = SyncConfig {
            min_confirmations: 6,
            ..Default::default()
        };
        assert_eq!(config.import_limit(100), 94);
        assert_eq!(config.import_limit(3), 0);
        assert_eq!(SyncConfig::default().import_limit(7), 7);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"min_confirmations": 2}"#).unwrap();
        assert_eq!(config.min_confirmations, 2);
        assert_eq!(config.start_height, None);
        assert_eq!(config.poll_interval_ms, 10_000);
    }
}
