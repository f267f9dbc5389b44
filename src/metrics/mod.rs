//! Derived metrics and their persistent store
//!
//! ## Schema Overview
//!
//! ```text
//! MeasurementRecord (1) ──< DerivedMetric (N)
//!                              key: (run_id, metric_name, procedure, seq_num)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use chipmetrics::manifest::ChipId;
//! use chipmetrics::metrics::{DerivedMetricBuilder, MetricsStore};
//!
//! let mut store = MetricsStore::new();
//! let metric = DerivedMetricBuilder::new("run-001", ChipId::new("Alisson", 67), "IVg", 0, "on_off_ratio", 42.0)
//!     .unit("")
//!     .build();
//! store.merge(vec![metric.clone()]);
//!
//! // Re-extraction with the same key replaces the older row
//! store.merge(vec![metric]);
//! assert_eq!(store.len(), 1);
//! ```

mod record;
mod store;

pub use record::{DerivedMetric, DerivedMetricBuilder, MetricKey, MetricValue, FLAG_FAILED_VALIDATION};
pub use store::{metrics_schema, MergeStats, MetricsStore};
