//! Extractor capabilities
//!
//! An extractor turns the columnar data of one measurement into at most one
//! [`DerivedMetric`]; a pairwise extractor turns two time-adjacent repeats of the
//! same procedure on the same chip into zero or more metrics. Both declare the
//! procedures they apply to and are registered explicitly in an
//! [`ExtractorRegistry`].
//!
//! ```rust
//! use chipmetrics::extractor::ExtractorRegistry;
//!
//! let registry = ExtractorRegistry::with_defaults();
//! assert!(!registry.extractors_for("IVg").is_empty());
//! assert!(registry.extractors_for("unknown").is_empty());
//! ```

pub mod builtin;
mod registry;

pub use registry::ExtractorRegistry;

use crate::manifest::MeasurementRecord;
use crate::metrics::DerivedMetric;
use crate::storage::MeasurementData;
use crate::Result;

/// Single-measurement metric extractor.
///
/// Implementations must be stateless or hold only immutable parameters; one
/// instance is shared by every worker thread.
pub trait Extractor: Send + Sync {
    /// Extractor name, recorded as the metric's extraction method.
    fn name(&self) -> &str;

    /// Procedure names this extractor applies to.
    fn applicable_procedures(&self) -> Vec<String>;

    /// Extract a metric.
    ///
    /// `Ok(None)` means the extractor opts out for this measurement.
    ///
    /// # Errors
    /// Any error drops this extractor's contribution for this measurement only
    fn extract(
        &self,
        data: &MeasurementData,
        measurement: &MeasurementRecord,
    ) -> Result<Option<DerivedMetric>>;

    /// Sanity check; a `false` keeps the metric but flags it.
    fn validate(&self, _metric: &DerivedMetric) -> bool {
        true
    }
}

/// Metric extractor over two consecutive measurements.
pub trait PairwiseExtractor: Send + Sync {
    /// Extractor name, recorded as the metric's extraction method.
    fn name(&self) -> &str;

    /// Procedure names this extractor applies to.
    fn applicable_procedures(&self) -> Vec<String>;

    /// Gate deciding whether two adjacent measurements form a pair.
    ///
    /// `first` is always the earlier measurement. Any bound on the time gap
    /// between the two is the extractor's own policy.
    fn should_pair(&self, first: &MeasurementRecord, second: &MeasurementRecord) -> bool;

    /// Extract metrics from a pair. Metrics are attributed to `second`.
    ///
    /// # Errors
    /// Any error drops this pair's contribution only
    fn extract_pairwise(
        &self,
        first: (&MeasurementRecord, &MeasurementData),
        second: (&MeasurementRecord, &MeasurementData),
    ) -> Result<Vec<DerivedMetric>>;

    /// Sanity check; a `false` keeps the metric but flags it.
    fn validate(&self, _metric: &DerivedMetric) -> bool {
        true
    }
}
