//! # chipmetrics: Manifest-Driven Metric Extraction
//!
//! chipmetrics turns the manifest of staged device measurements into derived
//! metrics, and pairs light-exposure experiments with the laser calibration
//! curve that was valid when they ran.
//!
//! ## Design Principles
//!
//! - **Idempotent reruns**: metrics are keyed by (run, metric, procedure,
//!   sequence number); a rerun supersedes instead of duplicating
//! - **Failure isolation**: a bad measurement or a panicking extractor costs
//!   only its own contribution, never the batch
//! - **Explicit wiring**: configuration and extractors are passed in, the
//!   registry is built from declared lists
//! - **Non-destructive outputs**: staged inputs are read-only, outputs are
//!   written through temp files and renamed into place
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chipmetrics::calibration::CalibrationMatcher;
//! use chipmetrics::config::{DeriveOptions, PipelineConfig};
//! use chipmetrics::extraction::MetricPipeline;
//!
//! chipmetrics::telemetry::init_tracing("chipmetrics=info");
//!
//! let config = PipelineConfig::builder("data/stage/manifest.parquet").build()?;
//! let pipeline = MetricPipeline::with_defaults(config.clone());
//! let outcome = pipeline.derive_all_metrics(&DeriveOptions::default())?;
//! println!("{}", outcome.summary);
//!
//! let manifest = pipeline.load_manifest()?;
//! let matcher = CalibrationMatcher::from_manifest(&manifest, &config.calibration_procedure);
//! let report = matcher.enrich_chip_history(
//!     "data/histories/Alisson67_history.parquet",
//!     "data/enriched",
//!     false,
//!     config.staleness_threshold_hours,
//! )?;
//! println!("{}: {} matched, {} missing", report.chip, report.matched(), report.missing);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod calibration;
pub mod config;
pub mod error;
pub mod extraction;
pub mod extractor;
pub mod manifest;
pub mod metrics;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};
