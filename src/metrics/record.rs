//! Derived Metric - one analytical result extracted from a measurement

use crate::manifest::{ChipId, MeasurementRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flag set on a metric whose extractor rejected it in `validate`.
pub const FLAG_FAILED_VALIDATION: &str = "failed_validation";

/// Metric payload: exactly one of float, string, or JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    /// Numeric value
    Float(f64),
    /// Text value
    Text(String),
    /// Structured value
    Json(serde_json::Value),
}

impl MetricValue {
    /// Numeric value, if this is a float.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<serde_json::Value> for MetricValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Composite identity of a metric in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    /// Measurement run
    pub run_id: String,
    /// Metric name
    pub metric_name: String,
    /// Procedure name
    pub procedure: String,
    /// Sequence number within the chip's procedure history
    pub seq_num: u64,
}

/// Derived Metric represents one value extracted from one measurement
/// (or from an adjacent pair of measurements).
///
/// Metrics are never mutated once stored; re-extraction with the same
/// [`MetricKey`] supersedes the older row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    run_id: String,
    chip: ChipId,
    procedure: String,
    seq_num: u64,
    metric_name: String,
    metric_category: String,
    value: MetricValue,
    unit: Option<String>,
    extraction_method: String,
    extraction_version: String,
    extraction_timestamp: DateTime<Utc>,
    confidence: f64,
    flags: Option<String>,
}

impl DerivedMetric {
    /// Start a metric for `measurement`, copying its identity fields.
    #[must_use]
    pub fn builder(
        measurement: &MeasurementRecord,
        metric_name: impl Into<String>,
        value: impl Into<MetricValue>,
    ) -> DerivedMetricBuilder {
        DerivedMetricBuilder::new(
            measurement.run_id(),
            measurement.chip().clone(),
            measurement.procedure(),
            measurement.seq_num(),
            metric_name,
            value,
        )
    }

    /// Get the run ID.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Get the chip identity.
    #[must_use]
    pub const fn chip(&self) -> &ChipId {
        &self.chip
    }

    /// Get the procedure name.
    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Get the sequence number.
    #[must_use]
    pub const fn seq_num(&self) -> u64 {
        self.seq_num
    }

    /// Get the metric name.
    #[must_use]
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Get the metric category.
    #[must_use]
    pub fn metric_category(&self) -> &str {
        &self.metric_category
    }

    /// Get the value.
    #[must_use]
    pub const fn value(&self) -> &MetricValue {
        &self.value
    }

    /// Get the unit, if any.
    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Get the extraction method (extractor name).
    #[must_use]
    pub fn extraction_method(&self) -> &str {
        &self.extraction_method
    }

    /// Get the code revision that produced this metric.
    #[must_use]
    pub fn extraction_version(&self) -> &str {
        &self.extraction_version
    }

    /// Get the extraction time.
    #[must_use]
    pub const fn extraction_timestamp(&self) -> DateTime<Utc> {
        self.extraction_timestamp
    }

    /// Get the confidence in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Get the comma-separated quality flags, if any.
    #[must_use]
    pub fn flags(&self) -> Option<&str> {
        self.flags.as_deref()
    }

    /// Whether `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags
            .as_deref()
            .is_some_and(|flags| flags.split(',').any(|f| f == flag))
    }

    /// Composite store key.
    #[must_use]
    pub fn key(&self) -> MetricKey {
        MetricKey {
            run_id: self.run_id.clone(),
            metric_name: self.metric_name.clone(),
            procedure: self.procedure.clone(),
            seq_num: self.seq_num,
        }
    }

    /// Mark the metric as having failed its extractor's sanity check.
    ///
    /// The metric is kept; confidence is halved.
    pub fn mark_failed_validation(&mut self) {
        if !self.has_flag(FLAG_FAILED_VALIDATION) {
            self.confidence *= 0.5;
            self.push_flag(FLAG_FAILED_VALIDATION);
        }
    }

    pub(crate) fn stamp(&mut self, method: &str, version: &str, at: DateTime<Utc>) {
        if self.extraction_method.is_empty() {
            self.extraction_method = method.to_string();
        }
        self.extraction_version = version.to_string();
        self.extraction_timestamp = at;
    }

    fn push_flag(&mut self, flag: &str) {
        if let Some(flags) = self.flags.as_mut().filter(|f| !f.is_empty()) {
            flags.push(',');
            flags.push_str(flag);
            return;
        }
        self.flags = Some(flag.to_string());
    }
}

/// Builder for `DerivedMetric`.
#[derive(Debug)]
pub struct DerivedMetricBuilder {
    metric: DerivedMetric,
}

impl DerivedMetricBuilder {
    /// Create a new builder with the identity fields and value.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        chip: ChipId,
        procedure: impl Into<String>,
        seq_num: u64,
        metric_name: impl Into<String>,
        value: impl Into<MetricValue>,
    ) -> Self {
        Self {
            metric: DerivedMetric {
                run_id: run_id.into(),
                chip,
                procedure: procedure.into(),
                seq_num,
                metric_name: metric_name.into(),
                metric_category: "electrical".to_string(),
                value: value.into(),
                unit: None,
                extraction_method: String::new(),
                extraction_version: String::new(),
                extraction_timestamp: Utc::now(),
                confidence: 1.0,
                flags: None,
            },
        }
    }

    /// Set the metric category.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.metric.metric_category = category.into();
        self
    }

    /// Set the unit.
    #[must_use]
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.metric.unit = Some(unit.into());
        self
    }

    /// Set the extraction method (defaults to the extractor name).
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.metric.extraction_method = method.into();
        self
    }

    /// Set the extraction version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.metric.extraction_version = version.into();
        self
    }

    /// Set a custom extraction timestamp.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metric.extraction_timestamp = timestamp;
        self
    }

    /// Set the confidence (clamped to `[0, 1]`).
    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.metric.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Add a quality flag.
    #[must_use]
    pub fn flag(mut self, flag: &str) -> Self {
        self.metric.push_flag(flag);
        self
    }

    /// Build the `DerivedMetric`.
    #[must_use]
    pub fn build(self) -> DerivedMetric {
        self.metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric() -> DerivedMetric {
        DerivedMetricBuilder::new("run-1", ChipId::new("Alisson", 67), "IVg", 3, "on_off_ratio", 12.5)
            .unit("")
            .build()
    }

    #[test]
    fn test_derived_metric_new() {
        let m = metric();
        assert_eq!(m.run_id(), "run-1");
        assert_eq!(m.seq_num(), 3);
        assert_eq!(m.value().as_f64(), Some(12.5));
        assert!((m.confidence() - 1.0).abs() < f64::EPSILON);
        assert!(m.flags().is_none());
        assert_eq!(
            m.key(),
            MetricKey {
                run_id: "run-1".into(),
                metric_name: "on_off_ratio".into(),
                procedure: "IVg".into(),
                seq_num: 3,
            }
        );
    }

    #[test]
    fn test_failed_validation_halves_confidence_once() {
        let mut m = metric();
        m.mark_failed_validation();
        m.mark_failed_validation();
        assert!((m.confidence() - 0.5).abs() < f64::EPSILON);
        assert_eq!(m.flags(), Some(FLAG_FAILED_VALIDATION));
    }

    #[test]
    fn test_flags_accumulate() {
        let mut m = DerivedMetricBuilder::new("r", ChipId::new("A", 1), "It", 0, "x", "text")
            .flag("low_snr")
            .build();
        m.mark_failed_validation();
        assert_eq!(m.flags(), Some("low_snr,failed_validation"));
        assert!(m.has_flag("low_snr"));
        assert!(!m.has_flag("low"));
    }

    #[test]
    fn test_stamp_keeps_explicit_method() {
        let mut m = DerivedMetricBuilder::new("r", ChipId::new("A", 1), "It", 0, "x", 1.0)
            .method("custom")
            .build();
        let at = Utc::now();
        m.stamp("extractor", "v1", at);
        assert_eq!(m.extraction_method(), "custom");
        assert_eq!(m.extraction_version(), "v1");
        assert_eq!(m.extraction_timestamp(), at);
    }
}
