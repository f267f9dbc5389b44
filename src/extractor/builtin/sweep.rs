//! Gate / drain sweep extractors

use super::{finite_abs, CURRENT_COLUMNS};
use crate::extractor::Extractor;
use crate::manifest::MeasurementRecord;
use crate::metrics::{DerivedMetric, MetricValue};
use crate::storage::MeasurementData;
use crate::Result;

/// Span of `|I|` over a sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentRangeExtractor;

impl Extractor for CurrentRangeExtractor {
    fn name(&self) -> &str {
        "current_range"
    }

    fn applicable_procedures(&self) -> Vec<String> {
        vec!["IVg".to_string(), "IV".to_string()]
    }

    fn extract(
        &self,
        data: &MeasurementData,
        measurement: &MeasurementRecord,
    ) -> Result<Option<DerivedMetric>> {
        let current = finite_abs(&data.column_f64(CURRENT_COLUMNS)?);
        if current.len() < 2 {
            return Ok(None);
        }
        let max = current.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = current.iter().copied().fold(f64::INFINITY, f64::min);

        Ok(Some(
            DerivedMetric::builder(measurement, "current_range", max - min)
                .unit("A")
                .build(),
        ))
    }

    fn validate(&self, metric: &DerivedMetric) -> bool {
        metric.value().as_f64().is_some_and(|v| v.is_finite() && v >= 0.0)
    }
}

/// Ratio of the largest to the smallest `|I|` over a gate sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnOffRatioExtractor;

/// Ratios beyond this are almost always a floor-noise artifact.
const MAX_PLAUSIBLE_ON_OFF_RATIO: f64 = 1e9;

impl Extractor for OnOffRatioExtractor {
    fn name(&self) -> &str {
        "on_off_ratio"
    }

    fn applicable_procedures(&self) -> Vec<String> {
        vec!["IVg".to_string()]
    }

    fn extract(
        &self,
        data: &MeasurementData,
        measurement: &MeasurementRecord,
    ) -> Result<Option<DerivedMetric>> {
        let current = finite_abs(&data.column_f64(CURRENT_COLUMNS)?);
        let max = current.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = current.iter().copied().fold(f64::INFINITY, f64::min);
        if current.len() < 2 || min <= 0.0 {
            return Ok(None);
        }

        Ok(Some(
            DerivedMetric::builder(measurement, "on_off_ratio", max / min)
                .unit("")
                .build(),
        ))
    }

    fn validate(&self, metric: &DerivedMetric) -> bool {
        matches!(metric.value(), MetricValue::Float(v) if (1.0..=MAX_PLAUSIBLE_ON_OFF_RATIO).contains(v))
    }
}
