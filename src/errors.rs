//! Error types for the telemetry exporter

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExporterError>;

#[derive(Debug, Error)]
pub enum ExporterError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built or used
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Batch violated the construction contract
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Batch could not fit in the spool even after eviction
    #[error("Batch of {size} bytes does not fit in spool capacity of {capacity} bytes")]
    SpoolOverflow { size: u64, capacity: u64 },

    /// Generic error with message
    #[error("Error: {0}")]
    Other(String),
}
