//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the view engine and its service loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Network whose `index_progress` row bounds catch-up, e.g. `"mainnet"`.
    #[serde(default = "default_network")]
    pub network: String,
    /// Handler failures per block before the runner stops processing it.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u64,
    /// Fallback poll interval of the service loop (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Log catch-up progress every N blocks.
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: u64,
    /// Persist the watermark every N blocks during a reindex.
    #[serde(default = "default_reindex_checkpoint_interval")]
    pub reindex_checkpoint_interval: u64,
    /// Sample table row counts every N heights.
    #[serde(default = "default_row_count_sample_interval")]
    pub row_count_sample_interval: u64,
    /// Warn about tables larger than this.
    #[serde(default = "default_row_count_warn_threshold")]
    pub row_count_warn_threshold: u64,
    #[serde(default = "default_new_block_channel")]
    pub new_block_channel: String,
    #[serde(default = "default_reorg_channel")]
    pub reorg_channel: String,
}

fn default_network() -> String { "mainnet".into() }
fn default_error_threshold() -> u64 { 50 }
fn default_poll_interval_ms() -> u64 { 5_000 }
fn default_progress_log_interval() -> u64 { 1_000 }
fn default_reindex_checkpoint_interval() -> u64 { 100 }
fn default_row_count_sample_interval() -> u64 { 1_000 }
fn default_row_count_warn_threshold() -> u64 { 10_000_000 }
fn default_new_block_channel() -> String { "new_block".into() }
fn default_reorg_channel() -> String { "reorg".into() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            error_threshold: default_error_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_log_interval: default_progress_log_interval(),
            reindex_checkpoint_interval: default_reindex_checkpoint_interval(),
            row_count_sample_interval: default_row_count_sample_interval(),
            row_count_warn_threshold: default_row_count_warn_threshold(),
            new_block_channel: default_new_block_channel(),
            reorg_channel: default_reorg_channel(),
        }
    }
}

impl EngineConfig {
    /// Config for a given network with every other field at its default.
    pub fn for_network(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Default::default()
        }
    }

    pub fn with_error_threshold(mut self, threshold: u64) -> Self {
        self.error_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.error_threshold, 50);
        assert_eq!(cfg.poll_interval_ms, 5_000);
        assert_eq!(cfg.reindex_checkpoint_interval, 100);
        assert_eq!(cfg.row_count_warn_threshold, 10_000_000);
        assert_eq!(cfg.new_block_channel, "new_block");
        assert_eq!(cfg.reorg_channel, "reorg");
    }

    #[test]
    fn partial_override() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"network":"testnet","error_threshold":3}"#).unwrap();
        assert_eq!(cfg.network, "testnet");
        assert_eq!(cfg.error_threshold, 3);
        assert_eq!(cfg.progress_log_interval, 1_000);
    }
}
