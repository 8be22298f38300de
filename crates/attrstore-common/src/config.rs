//! Configuration types for attrstore
//!
//! This module defines configuration structures used by a metadata node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for an attrstore node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Store configuration
    pub store: StoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Absolute path of the redb snapshot file
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.store.snapshot_file)
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for the snapshot store
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "attrstore-node".to_string(),
            data_dir: PathBuf::from("/var/lib/attrstore"),
        }
    }
}

/// Store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshot file name, relative to the data directory
    pub snapshot_file: PathBuf,
    /// Number of committed entries kept by the in-process log
    pub log_retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_file: PathBuf::from("attrstore.redb"),
            log_retention: 4096,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.name, "attrstore-node");
        assert_eq!(config.store.log_retention, 4096);
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/var/lib/attrstore/attrstore.redb")
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"node": {"data_dir": "/tmp/n1"}}"#).unwrap();
        assert_eq!(config.node.name, "attrstore-node");
        assert_eq!(config.snapshot_path(), PathBuf::from("/tmp/n1/attrstore.redb"));
        assert_eq!(config.logging.level, "info");
    }
}
