//! Current-vs-time extractors

use super::{CURRENT_COLUMNS, LASER_VOLTAGE_COLUMNS};
use crate::extractor::Extractor;
use crate::manifest::MeasurementRecord;
use crate::metrics::DerivedMetric;
use crate::storage::MeasurementData;
use crate::Result;

/// Mean current with the laser on minus mean current with it off.
#[derive(Debug, Clone, Copy)]
pub struct PhotoresponseExtractor {
    on_threshold_v: f64,
}

impl PhotoresponseExtractor {
    /// Laser drive voltage above which a sample counts as illuminated.
    #[must_use]
    pub const fn with_on_threshold(on_threshold_v: f64) -> Self {
        Self { on_threshold_v }
    }
}

impl Default for PhotoresponseExtractor {
    fn default() -> Self {
        Self::with_on_threshold(0.0)
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

impl Extractor for PhotoresponseExtractor {
    fn name(&self) -> &str {
        "photoresponse"
    }

    fn applicable_procedures(&self) -> Vec<String> {
        vec!["It".to_string()]
    }

    fn extract(
        &self,
        data: &MeasurementData,
        measurement: &MeasurementRecord,
    ) -> Result<Option<DerivedMetric>> {
        let current = data.column_f64(CURRENT_COLUMNS)?;
        let Some(laser) = data.column_f64_opt(LASER_VOLTAGE_COLUMNS)? else {
            return Ok(None);
        };

        let (mut on, mut off) = (Vec::new(), Vec::new());
        for (&i, &vl) in current.iter().zip(&laser) {
            if !i.is_finite() || !vl.is_finite() {
                continue;
            }
            if vl > self.on_threshold_v {
                on.push(i);
            } else {
                off.push(i);
            }
        }
        let (Some(on_mean), Some(off_mean)) = (mean(&on), mean(&off)) else {
            return Ok(None);
        };

        Ok(Some(
            DerivedMetric::builder(measurement, "delta_current", on_mean - off_mean)
                .category("photoresponse")
                .unit("A")
                .build(),
        ))
    }

    fn validate(&self, metric: &DerivedMetric) -> bool {
        metric.value().as_f64().is_some_and(f64::is_finite)
    }
}
