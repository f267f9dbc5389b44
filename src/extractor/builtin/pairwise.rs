//! Consecutive-sweep drift

use super::{argmin_abs, max_abs, CURRENT_COLUMNS, GATE_VOLTAGE_COLUMNS};
use crate::extractor::PairwiseExtractor;
use crate::manifest::MeasurementRecord;
use crate::metrics::DerivedMetric;
use crate::storage::MeasurementData;
use crate::{Error, Result};

/// Drain voltage tolerance when matching sweep configurations.
const VDS_TOLERANCE_V: f64 = 1e-9;

/// Drift between two consecutive gate sweeps of one chip.
///
/// Emits the change in peak `|I|` and the shift of the gate voltage at minimum
/// `|I|`. Two sweeps pair only if their drain voltages match (when both are
/// recorded) and, if configured, they lie within `max_gap_hours` of each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsecutiveSweepExtractor {
    max_gap_hours: Option<f64>,
}

impl ConsecutiveSweepExtractor {
    /// Only pair sweeps acquired at most `hours` apart.
    #[must_use]
    pub const fn with_max_gap_hours(hours: f64) -> Self {
        Self {
            max_gap_hours: Some(hours),
        }
    }

    /// Configured gap bound, if any.
    #[must_use]
    pub const fn max_gap_hours(&self) -> Option<f64> {
        self.max_gap_hours
    }

    fn sweep(data: &MeasurementData, run_id: &str) -> Result<(Vec<f64>, Vec<f64>)> {
        let wrap = |e: Error| Error::extraction(run_id, "consecutive_sweep", e.to_string());
        let vg = data.column_f64(GATE_VOLTAGE_COLUMNS).map_err(wrap)?;
        let current = data.column_f64(CURRENT_COLUMNS).map_err(wrap)?;
        Ok((vg, current))
    }
}

impl PairwiseExtractor for ConsecutiveSweepExtractor {
    fn name(&self) -> &str {
        "consecutive_sweep"
    }

    fn applicable_procedures(&self) -> Vec<String> {
        vec!["IVg".to_string()]
    }

    fn should_pair(&self, first: &MeasurementRecord, second: &MeasurementRecord) -> bool {
        if let (Some(a), Some(b)) = (first.extra_f64("vds_v"), second.extra_f64("vds_v")) {
            if (a - b).abs() > VDS_TOLERANCE_V {
                return false;
            }
        }
        match self.max_gap_hours {
            Some(max) => {
                #[allow(clippy::cast_precision_loss)]
                let gap_hours = (second.acquired_at() - first.acquired_at()).num_milliseconds()
                    as f64
                    / 3_600_000.0;
                gap_hours.abs() <= max
            }
            None => true,
        }
    }

    fn extract_pairwise(
        &self,
        first: (&MeasurementRecord, &MeasurementData),
        second: (&MeasurementRecord, &MeasurementData),
    ) -> Result<Vec<DerivedMetric>> {
        let (vg1, i1) = Self::sweep(first.1, first.0.run_id())?;
        let (vg2, i2) = Self::sweep(second.1, second.0.run_id())?;
        let target = second.0;

        let mut metrics = Vec::with_capacity(2);
        if let (Some(peak1), Some(peak2)) = (max_abs(&i1), max_abs(&i2)) {
            metrics.push(
                DerivedMetric::builder(target, "consecutive_sweep_delta_current", peak2 - peak1)
                    .category("drift")
                    .unit("A")
                    .build(),
            );
        }

        let vmin = |vg: &[f64], current: &[f64]| {
            argmin_abs(current).and_then(|i| vg.get(i).copied().filter(|v| v.is_finite()))
        };
        if let (Some(v1), Some(v2)) = (vmin(&vg1, &i1), vmin(&vg2, &i2)) {
            metrics.push(
                DerivedMetric::builder(target, "consecutive_sweep_delta_vmin", v2 - v1)
                    .category("drift")
                    .unit("V")
                    .build(),
            );
        }
        Ok(metrics)
    }

    fn validate(&self, metric: &DerivedMetric) -> bool {
        metric.value().as_f64().is_some_and(f64::is_finite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ChipId;
    use arrow::array::Float64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn sweep(vg: Vec<f64>, current: Vec<f64>) -> MeasurementData {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("Vg", DataType::Float64, false),
                Field::new("I", DataType::Float64, false),
            ])),
            vec![
                Arc::new(Float64Array::from(vg)),
                Arc::new(Float64Array::from(current)),
            ],
        )
        .unwrap();
        MeasurementData::from_batch(batch)
    }

    fn record(run: &str, hours: i64, vds: f64) -> MeasurementRecord {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        MeasurementRecord::builder(run, "IVg", ChipId::new("Alisson", 67), t0 + Duration::hours(hours), "x")
            .extra("vds_v", vds)
            .seq_num(u64::try_from(hours).unwrap())
            .build()
    }

    #[test]
    fn test_should_pair_requires_matching_vds() {
        let extractor = ConsecutiveSweepExtractor::default();
        assert!(extractor.should_pair(&record("a", 0, 0.1), &record("b", 1, 0.1)));
        assert!(!extractor.should_pair(&record("a", 0, 0.1), &record("b", 1, 0.2)));
    }

    #[test]
    fn test_gap_bound_is_per_extractor() {
        let unbounded = ConsecutiveSweepExtractor::default();
        let bounded = ConsecutiveSweepExtractor::with_max_gap_hours(2.0);
        let (a, b) = (record("a", 0, 0.1), record("b", 48, 0.1));
        assert!(unbounded.should_pair(&a, &b));
        assert!(!bounded.should_pair(&a, &b));
        assert!(bounded.should_pair(&a, &record("c", 2, 0.1)));
        assert_eq!(bounded.max_gap_hours(), Some(2.0));
    }

    #[test]
    fn test_extract_pairwise_emits_both_metrics_on_later_run() {
        let first = record("a", 0, 0.1);
        let second = record("b", 1, 0.1);
        let d1 = sweep(vec![-1.0, 0.0, 1.0], vec![2.0, 0.1, 3.0]);
        let d2 = sweep(vec![-1.0, 0.0, 1.0], vec![0.2, 2.0, 4.0]);

        let metrics = ConsecutiveSweepExtractor::default()
            .extract_pairwise((&first, &d1), (&second, &d2))
            .unwrap();

        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.run_id() == "b" && m.seq_num() == 1));
        let current = metrics
            .iter()
            .find(|m| m.metric_name() == "consecutive_sweep_delta_current")
            .unwrap();
        assert!((current.value().as_f64().unwrap() - 1.0).abs() < 1e-12);
        let vmin = metrics
            .iter()
            .find(|m| m.metric_name() == "consecutive_sweep_delta_vmin")
            .unwrap();
        assert!((vmin.value().as_f64().unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_columns_fail_the_pair() {
        let first = record("a", 0, 0.1);
        let bad = MeasurementData::from_batch(
            RecordBatch::try_new(
                Arc::new(Schema::new(vec![Field::new("t", DataType::Float64, false)])),
                vec![Arc::new(Float64Array::from(vec![0.0]))],
            )
            .unwrap(),
        );
        let good = sweep(vec![0.0], vec![1.0]);
        let err = ConsecutiveSweepExtractor::default()
            .extract_pairwise((&first, &bad), (&record("b", 1, 0.1), &good))
            .unwrap_err();
        assert!(err.to_string().contains("run a"));
    }
}
