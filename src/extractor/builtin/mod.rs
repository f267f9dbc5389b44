//! Built-in extractors
//!
//! These define extraction contracts for the common sweep procedures. The
//! physics is deliberately simple; specialised heuristics belong in
//! caller-supplied extractors registered next to these.

mod pairwise;
mod sweep;
mod timeseries;

pub use pairwise::ConsecutiveSweepExtractor;
pub use sweep::{CurrentRangeExtractor, OnOffRatioExtractor};
pub use timeseries::PhotoresponseExtractor;

use super::{Extractor, PairwiseExtractor};
use std::sync::Arc;

/// Current column aliases.
pub const CURRENT_COLUMNS: &[&str] = &["I", "I (A)", "current", "id", "ids"];

/// Gate voltage column aliases.
pub const GATE_VOLTAGE_COLUMNS: &[&str] = &["Vg", "Vg (V)", "gate_voltage", "vgs"];

/// Laser drive voltage column aliases.
pub const LASER_VOLTAGE_COLUMNS: &[&str] = &["VL", "VL (V)", "laser_voltage", "laser_voltage_v"];

/// Default single-measurement extractors, in registration order.
#[must_use]
pub fn default_extractors() -> Vec<Arc<dyn Extractor>> {
    vec![
        Arc::new(CurrentRangeExtractor),
        Arc::new(OnOffRatioExtractor),
        Arc::new(PhotoresponseExtractor::default()),
    ]
}

/// Default pairwise extractors.
#[must_use]
pub fn default_pairwise_extractors() -> Vec<Arc<dyn PairwiseExtractor>> {
    vec![Arc::new(ConsecutiveSweepExtractor::default())]
}

/// Finite absolute values.
pub(crate) fn finite_abs(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.abs())
        .collect()
}

/// Index of the smallest finite `|value|`.
pub(crate) fn argmin_abs(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .min_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
        .map(|(i, _)| i)
}

/// Largest finite `|value|`.
pub(crate) fn max_abs(values: &[f64]) -> Option<f64> {
    finite_abs(values).into_iter().reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_ignore_non_finite() {
        let values = [f64::NAN, -3.0, 0.5, f64::INFINITY, 2.0];
        assert_eq!(finite_abs(&values), vec![3.0, 0.5, 2.0]);
        assert_eq!(argmin_abs(&values), Some(2));
        assert_eq!(max_abs(&values), Some(3.0));
        assert_eq!(argmin_abs(&[f64::NAN]), None);
        assert_eq!(max_abs(&[]), None);
    }
}
