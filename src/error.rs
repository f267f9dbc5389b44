//! Error types for chipmetrics
//!
//! Only a missing manifest, an unreadable store/history, or invalid configuration
//! stop a batch. Per-row and per-pair failures are logged and counted instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// chipmetrics error types
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest file absent: nothing to process
    #[error("Manifest not found: {}\nRun the staging step first to build the measurement index", .0.display())]
    ManifestMissing(PathBuf),

    /// Storage error (Parquet/Arrow file handling)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Required column absent or of an unusable type
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// An extractor failed on one measurement
    #[error("Extractor '{extractor}' failed on run {run_id}: {message}")]
    Extraction {
        /// Measurement the extractor was applied to
        run_id: String,
        /// Extractor name
        extractor: String,
        /// Failure description
        message: String,
    },

    /// One side of a candidate pair could not be loaded
    #[error("Pair ({first}, {second}) could not be loaded: {message}")]
    PairLoad {
        /// Earlier run of the pair
        first: String,
        /// Later run of the pair
        second: String,
        /// Failure description
        message: String,
    },

    /// Invalid caller input or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (config or metric payload) error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an [`Error::Extraction`] for `extractor` failing on `run_id`.
    pub fn extraction(
        run_id: impl Into<String>,
        extractor: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Extraction {
            run_id: run_id.into(),
            extractor: extractor.into(),
            message: message.into(),
        }
    }

    /// Whether this error must abort a batch run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ManifestMissing(_) | Self::InvalidInput(_))
    }
}
