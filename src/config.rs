//! Pipeline configuration
//!
//! `PipelineConfig` describes where things live and session-wide defaults; it is
//! built once and passed into [`MetricPipeline`](crate::extraction::MetricPipeline)
//! and [`CalibrationMatcher`](crate::calibration::CalibrationMatcher) explicitly.
//! `DeriveOptions` carries the per-invocation knobs of a metric derivation.

use crate::manifest::ChipId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Default maximum calibration age before a match is flagged stale
pub const DEFAULT_STALENESS_THRESHOLD_HOURS: f64 = 24.0;

/// Default procedure name of calibration measurements
pub const DEFAULT_CALIBRATION_PROCEDURE: &str = "calibration";

/// Either every item, or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection<T> {
    /// No filtering
    All,
    /// Keep only these items
    Only(Vec<T>),
}

impl<T> Default for Selection<T> {
    fn default() -> Self {
        Self::All
    }
}

impl<T: PartialEq> Selection<T> {
    /// Select only `items`.
    pub fn only(items: impl IntoIterator<Item = T>) -> Self {
        Self::Only(items.into_iter().collect())
    }

    /// Whether `item` passes the selection.
    pub fn matches(&self, item: &T) -> bool {
        match self {
            Self::All => true,
            Self::Only(items) => items.contains(item),
        }
    }

    /// Whether this is [`Selection::All`].
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn default_extraction_version() -> String {
    format!("chipmetrics-{}", env!("CARGO_PKG_VERSION"))
}

fn default_calibration_procedure() -> String {
    DEFAULT_CALIBRATION_PROCEDURE.to_string()
}

const fn default_staleness_threshold_hours() -> f64 {
    DEFAULT_STALENESS_THRESHOLD_HOURS
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path to the manifest Parquet file
    pub manifest_path: PathBuf,

    /// Base directory for relative partition paths (default: manifest directory)
    #[serde(default)]
    pub stage_root: Option<PathBuf>,

    /// Metrics store location (default: `<stage_root>/metrics/metrics.parquet`)
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,

    /// Worker threads for parallel extraction
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Code revision stamped onto every derived metric
    #[serde(default = "default_extraction_version")]
    pub extraction_version: String,

    /// Procedure name identifying calibration measurements
    #[serde(default = "default_calibration_procedure")]
    pub calibration_procedure: String,

    /// Maximum calibration age (hours) still considered `perfect`
    #[serde(default = "default_staleness_threshold_hours")]
    pub staleness_threshold_hours: f64,
}

impl PipelineConfig {
    /// Create a config builder for the given manifest.
    #[must_use]
    pub fn builder(manifest_path: impl Into<PathBuf>) -> PipelineConfigBuilder {
        PipelineConfigBuilder::new(manifest_path)
    }

    /// Parse and validate a JSON config document.
    ///
    /// # Errors
    /// Returns error on malformed JSON or invalid values
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] describing the first bad value
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidInput("workers must be at least 1".to_string()));
        }
        if !self.staleness_threshold_hours.is_finite() || self.staleness_threshold_hours < 0.0 {
            return Err(Error::InvalidInput(format!(
                "staleness threshold must be a non-negative number of hours, got {}",
                self.staleness_threshold_hours
            )));
        }
        if self.calibration_procedure.trim().is_empty() {
            return Err(Error::InvalidInput(
                "calibration procedure name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved base directory for partition paths.
    #[must_use]
    pub fn stage_root(&self) -> PathBuf {
        self.stage_root.clone().unwrap_or_else(|| {
            self.manifest_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        })
    }

    /// Resolved metrics store path.
    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.metrics_path
            .clone()
            .unwrap_or_else(|| self.stage_root().join("metrics").join("metrics.parquet"))
    }
}

/// Builder for `PipelineConfig`.
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a builder with defaults for everything but the manifest path.
    #[must_use]
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            config: PipelineConfig {
                manifest_path: manifest_path.into(),
                stage_root: None,
                metrics_path: None,
                workers: default_workers(),
                extraction_version: default_extraction_version(),
                calibration_procedure: default_calibration_procedure(),
                staleness_threshold_hours: DEFAULT_STALENESS_THRESHOLD_HOURS,
            },
        }
    }

    /// Set the base directory for relative partition paths.
    #[must_use]
    pub fn stage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.stage_root = Some(root.into());
        self
    }

    /// Set the metrics store location.
    #[must_use]
    pub fn metrics_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.metrics_path = Some(path.into());
        self
    }

    /// Set the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the extraction version stamp.
    #[must_use]
    pub fn extraction_version(mut self, version: impl Into<String>) -> Self {
        self.config.extraction_version = version.into();
        self
    }

    /// Set the calibration procedure name.
    #[must_use]
    pub fn calibration_procedure(mut self, procedure: impl Into<String>) -> Self {
        self.config.calibration_procedure = procedure.into();
        self
    }

    /// Set the staleness threshold in hours.
    #[must_use]
    pub fn staleness_threshold_hours(mut self, hours: f64) -> Self {
        self.config.staleness_threshold_hours = hours;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for out-of-range values
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-invocation options of [`MetricPipeline::derive_all_metrics`](crate::extraction::MetricPipeline::derive_all_metrics).
#[derive(Debug, Clone, PartialEq)]
pub struct DeriveOptions {
    /// Procedures to process
    pub procedures: Selection<String>,
    /// Chips to process
    pub chips: Selection<ChipId>,
    /// Use the worker pool
    pub parallel: bool,
    /// Worker count override (falls back to the config)
    pub workers: Option<usize>,
    /// Skip runs already present in the metrics store
    pub skip_existing: bool,
    /// Also run pairwise extractors
    pub include_pairwise: bool,
}

impl Default for DeriveOptions {
    fn default() -> Self {
        Self {
            procedures: Selection::All,
            chips: Selection::All,
            parallel: false,
            workers: None,
            skip_existing: false,
            include_pairwise: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = PipelineConfig::builder("/data/stage/manifest.parquet")
            .build()
            .unwrap();
        assert_eq!(config.stage_root(), PathBuf::from("/data/stage"));
        assert_eq!(
            config.metrics_path(),
            PathBuf::from("/data/stage/metrics/metrics.parquet")
        );
        assert!(config.workers >= 1);
        assert_eq!(config.calibration_procedure, "calibration");
        assert!(config.extraction_version.starts_with("chipmetrics-"));
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let err = PipelineConfig::builder("m.parquet").workers(0).build().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_builder_rejects_negative_threshold() {
        let result = PipelineConfig::builder("m.parquet")
            .staleness_threshold_hours(-1.0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{"manifest_path": "stage/manifest.parquet", "workers": 3}"#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert!((config.staleness_threshold_hours - 24.0).abs() < f64::EPSILON);
        assert_eq!(config.stage_root(), PathBuf::from("stage"));
    }

    #[test]
    fn test_selection_matches() {
        let all: Selection<String> = Selection::All;
        assert!(all.matches(&"IVg".to_string()));

        let only = Selection::only(["IVg".to_string()]);
        assert!(only.matches(&"IVg".to_string()));
        assert!(!only.matches(&"It".to_string()));
        assert!(!only.is_all());
    }
}
