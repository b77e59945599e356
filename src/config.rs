//! Configuration management for the telemetry exporter

use crate::telemetry::BatchLimits;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default spool capacity: 50 MiB
pub const DEFAULT_MAX_SPOOL_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ingestion endpoint that batches are POSTed to
    pub endpoint: String,

    /// Persist retryable failures to disk
    pub spool_enabled: bool,

    /// Directory holding spooled batches
    pub spool_dir: PathBuf,

    /// Maximum bytes resident in the spool directory
    pub max_spool_bytes: u64,

    /// HTTP timeout for a single request
    pub http_timeout: Duration,

    /// Maximum items per batch
    pub batch_max_items: usize,

    /// Maximum serialized bytes per batch
    pub batch_max_bytes: usize,

    /// Maximum items held in memory before the oldest are dropped
    pub buffer_max_items: usize,

    /// Period of the background spool sweep, `None` disables it
    pub sweep_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4318/v2.1/track".to_string(),
            spool_enabled: true,
            spool_dir: env::temp_dir().join("telemetry-exporter").join("spool"),
            max_spool_bytes: DEFAULT_MAX_SPOOL_BYTES,
            http_timeout: Duration::from_secs(10),
            batch_max_items: BatchLimits::default().max_items,
            batch_max_bytes: BatchLimits::default().max_bytes,
            buffer_max_items: 10_000,
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(endpoint) = lookup("EXPORTER_ENDPOINT") {
            config.endpoint = endpoint;
        }

        if let Some(enabled) = lookup("SPOOL_ENABLED") {
            config.spool_enabled = enabled.to_lowercase() == "true";
        }

        if let Some(dir) = lookup("SPOOL_DIR") {
            config.spool_dir = PathBuf::from(dir);
        }

        if let Some(max_bytes) = lookup("SPOOL_MAX_BYTES") {
            if let Ok(bytes) = max_bytes.parse() {
                config.max_spool_bytes = bytes;
            }
        }

        if let Some(timeout) = lookup("HTTP_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.http_timeout = Duration::from_secs(seconds);
            }
        }

        if let Some(max_items) = lookup("BATCH_MAX_ITEMS") {
            if let Ok(items) = max_items.parse() {
                config.batch_max_items = items;
            }
        }

        if let Some(max_bytes) = lookup("BATCH_MAX_BYTES") {
            if let Ok(bytes) = max_bytes.parse() {
                config.batch_max_bytes = bytes;
            }
        }

        if let Some(buffer_size) = lookup("BUFFER_MAX_ITEMS") {
            if let Ok(size) = buffer_size.parse() {
                config.buffer_max_items = size;
            }
        }

        if let Some(interval) = lookup("SWEEP_INTERVAL_SECONDS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.sweep_interval = (seconds > 0).then(|| Duration::from_secs(seconds));
            }
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("endpoint cannot be empty".to_string());
        }

        if let Err(e) = Url::parse(&self.endpoint) {
            return Err(format!("endpoint is not a valid URL: {}", e));
        }

        if self.batch_max_items == 0 {
            return Err("batch_max_items must be greater than 0".to_string());
        }

        if self.batch_max_bytes == 0 {
            return Err("batch_max_bytes must be greater than 0".to_string());
        }

        if self.buffer_max_items == 0 {
            return Err("buffer_max_items must be greater than 0".to_string());
        }

        if self.spool_enabled {
            if self.max_spool_bytes == 0 {
                return Err("max_spool_bytes must be greater than 0".to_string());
            }

            if self.batch_max_bytes as u64 > self.max_spool_bytes {
                return Err("batch_max_bytes cannot exceed max_spool_bytes".to_string());
            }
        }

        Ok(())
    }

    /// Batch limits derived from this configuration
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_items: self.batch_max_items,
            max_bytes: self.batch_max_bytes,
        }
    }
}
