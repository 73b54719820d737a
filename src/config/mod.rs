//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the dispatcher and its
//! storage backend.

mod yaml;

pub use yaml::{ConfigError, DispatcherConfig, StorageConfig, YamlLoader};
