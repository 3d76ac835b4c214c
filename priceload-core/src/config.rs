//! Serializable ingestion configuration.
//!
//! Loaded from TOML; every field has a default so a partial (or empty) file
//! is valid. Credentials are not part of the file.

use crate::data::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("parse config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration for all ingestion commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub universe: UniverseConfig,
    pub fetch: FetchConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
    pub paths: PathsConfig,
}

/// Reference-data paging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    /// Rows per reference page (the source's cap).
    pub page_size: usize,
    /// Default tracked-only filter when the caller does not choose.
    pub tracked_only: bool,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            tracked_only: false,
        }
    }
}

/// Market-data fetching and recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Symbols per bulk call (further capped by the source).
    pub batch_size: usize,
    /// Bulk attempts per batch before salvage.
    pub max_attempts: u32,
    /// Fixed sleep between bulk attempts.
    pub backoff_secs: u64,
    /// Sleep between salvage calls.
    pub salvage_delay_ms: u64,
    /// Liquid symbol probed to find the last trading day.
    pub probe_symbol: String,
    /// Calendar days covered by the probe.
    pub probe_days: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 150,
            max_attempts: 3,
            backoff_secs: 20,
            salvage_delay_ms: 100,
            probe_symbol: "SPY".to_string(),
            probe_days: 7,
        }
    }
}

/// Store tables and write sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub ticker_table: String,
    pub price_table: String,
    /// Records per upsert request.
    pub upsert_chunk: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ticker_table: "tickers".to_string(),
            price_table: "prices_2025".to_string(),
            upsert_chunk: 800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Trailing observations in the ADDV mean.
    pub addv_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { addv_window: 20 }
    }
}

/// On-disk locations for the full-history run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub checkpoint_dir: PathBuf,
    pub output: PathBuf,
    pub failures: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("data/tmp"),
            output: PathBuf::from("data/prices.parquet"),
            failures: PathBuf::from("data/failed_symbols.csv"),
        }
    }
}

impl IngestConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.universe.page_size == 0, "universe.page_size must be > 0"),
            (self.fetch.batch_size == 0, "fetch.batch_size must be > 0"),
            (self.fetch.max_attempts == 0, "fetch.max_attempts must be >= 1"),
            (self.fetch.probe_symbol.trim().is_empty(), "fetch.probe_symbol must be set"),
            (self.fetch.probe_days == 0, "fetch.probe_days must be > 0"),
            (self.store.upsert_chunk == 0, "store.upsert_chunk must be > 0"),
            (self.metrics.addv_window == 0, "metrics.addv_window must be > 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }

    /// Bulk retry and salvage pacing derived from `[fetch]`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch.max_attempts,
            backoff: Duration::from_secs(self.fetch.backoff_secs),
            salvage_delay: Duration::from_millis(self.fetch.salvage_delay_ms),
        }
    }
}
