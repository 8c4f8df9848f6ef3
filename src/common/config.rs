//! Configuration for minizero components

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator-specific config
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `minizero.toml` (optional) and `MINIZERO_*`
    /// environment variables, falling back to defaults.
    pub fn load() -> Self {
        match Self::load_from("minizero") {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file stem (extension optional).
    pub fn load_from(name: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(
                config::Environment::with_prefix("MINIZERO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }
}

/// Where the consensus log and snapshots are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
    Rocksdb,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Raft ID of this coordinator
    pub node_id: u64,

    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Address other members use to reach this coordinator
    pub advertise_addr: String,

    /// Directory for the consensus log and snapshots
    pub db_path: PathBuf,

    /// Persistence backend
    pub storage: StorageBackend,

    /// Replicas per group
    pub replicas: usize,

    /// Log entries applied before a snapshot is written
    pub snapshot_threshold: u64,

    /// Interval between StreamMembership pushes
    pub stream_interval_ms: u64,

    /// Cool-down before an UpdateMembership diff failure is returned
    pub update_backoff_ms: u64,

    /// Interval between rebalancing rounds (0 disables the rebalancer)
    pub rebalance_interval_secs: u64,

    /// Timeout for member health probes
    pub probe_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5080)),
            advertise_addr: "localhost:5080".to_string(),
            db_path: PathBuf::from("./zero-data"),
            storage: StorageBackend::Memory,
            replicas: 1,
            snapshot_threshold: 10_000,
            stream_interval_ms: 1_000,
            update_backoff_ms: 1_000,
            rebalance_interval_secs: 480,
            probe_timeout_ms: 500,
        }
    }
}

impl CoordinatorConfig {
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    pub fn update_backoff(&self) -> Duration {
        Duration::from_millis(self.update_backoff_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id == 0 {
            return Err(crate::Error::InvalidConfig(
                "node_id must be positive".into(),
            ));
        }
        if self.replicas == 0 {
            return Err(crate::Error::InvalidConfig(
                "replicas must be at least 1".into(),
            ));
        }
        if self.stream_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "stream_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_interval(), Duration::from_secs(1));
        assert_eq!(config.rebalance_interval(), Duration::from_secs(480));
    }

    #[test]
    fn test_validate_rejects_zero_replicas() {
        let config = CoordinatorConfig {
            replicas: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[coordinator]\nreplicas = 3\nstorage = \"sled\""
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.coordinator.replicas, 3);
        assert_eq!(config.coordinator.storage, StorageBackend::Sled);
        assert_eq!(config.coordinator.node_id, 1);
    }
}
