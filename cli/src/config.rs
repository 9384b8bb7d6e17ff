//! CLI configuration file.
//!
//! ```yaml
//! database_url: postgresql://localhost/chain
//! engine:
//!   network: mainnet
//!   error_threshold: 50
//! log:
//!   level: info
//!   json: false
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use chainview_core::EngineConfig;

use crate::telemetry::LogConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl CliConfig {
    /// Read `path`, or fall back to defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config file '{}'", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// The connection URL: command-line / environment first, then the file.
    pub fn database_url(&self, cli: Option<&str>) -> Result<String> {
        cli.map(str::to_string)
            .or_else(|| self.database_url.clone())
            .context("no database URL: pass --database-url, set DATABASE_URL, or add database_url to the config file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = CliConfig::from_yaml(
            "
database_url: postgresql://localhost/chain
engine:
  network: testnet
  error_threshold: 5
log:
  level: debug
",
        )
        .unwrap();
        assert_eq!(config.engine.network, "testnet");
        assert_eq!(config.engine.error_threshold, 5);
        assert_eq!(config.engine.poll_interval_ms, 5_000);
        assert_eq!(config.engine.reorg_channel, "reorg");
        assert_eq!(config.log.level, "debug");
        assert!(!config.log.json);
    }

    #[test]
    fn command_line_url_wins() {
        let config = CliConfig {
            database_url: Some("postgresql://file".into()),
            ..Default::default()
        };
        assert_eq!(
            config.database_url(Some("postgresql://flag")).unwrap(),
            "postgresql://flag"
        );
        assert_eq!(config.database_url(None).unwrap(), "postgresql://file");
        assert!(CliConfig::default().database_url(None).is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = CliConfig::load(Some(Path::new("/nonexistent/chainview.yaml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/chainview.yaml"));
    }
}
