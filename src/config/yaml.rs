//! YAML configuration parsing.
//!
//! Parses the dispatcher configuration (`chrona.yaml`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::DEFAULT_FAST_PATH_THRESHOLD;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Dispatcher configuration (chrona.yaml).
///
/// Every field is optional; an empty document yields the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Timers due within this many seconds are kept in memory only.
    pub fast_path_threshold_secs: u64,
    /// Pause before relaunching the loop after a lost connection.
    pub restart_delay_ms: u64,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Log filter directive used when `RUST_LOG` is unset (e.g. "debug").
    pub log_level: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fast_path_threshold_secs: DEFAULT_FAST_PATH_THRESHOLD.as_secs(),
            restart_delay_ms: 0,
            storage: StorageConfig::default(),
            log_level: None,
        }
    }
}

impl DispatcherConfig {
    /// The fast-path window as a duration.
    pub fn fast_path_threshold(&self) -> Duration {
        Duration::from_secs(self.fast_path_threshold_secs)
    }

    /// The restart delay as a duration.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Loader for YAML configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load the dispatcher configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<DispatcherConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_config(&content)
    }

    /// Parse the dispatcher configuration from a YAML string.
    pub fn parse_config(yaml: &str) -> Result<DispatcherConfig, ConfigError> {
        // serde_yaml rejects an empty document; treat it as all defaults.
        if yaml.trim().is_empty() {
            return Ok(DispatcherConfig::default());
        }
        let config: DispatcherConfig = serde_yaml::from_str(yaml)?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Validate a dispatcher configuration.
    fn validate_config(config: &DispatcherConfig) -> Result<(), ConfigError> {
        if let StorageConfig::Sqlite { path } = &config.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::MissingField("storage.path".into()));
            }
        }

        if let Some(level) = &config.log_level {
            if level.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "log_level cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }
}
