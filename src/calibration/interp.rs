//! Voltage → optical power curves

use crate::storage::{self, MeasurementData};
use crate::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Drive voltage column aliases in calibration data.
pub(crate) const CURVE_VOLTAGE_COLUMNS: &[&str] = &[
    "VL",
    "VL (V)",
    "laser_voltage",
    "laser_voltage_v",
    "voltage",
    "V",
];

/// Optical power column aliases in calibration data.
pub(crate) const CURVE_POWER_COLUMNS: &[&str] = &[
    "power",
    "Power (W)",
    "power_w",
    "optical_power",
    "Plaser",
    "P",
];

/// Linear interpolation over a curve sorted by ascending `xs`.
///
/// Outside `[xs[0], xs[n-1]]` the boundary value is returned. Returns `None`
/// for fewer than two points or mismatched lengths.
#[must_use]
pub fn interpolate_power(xs: &[f64], ys: &[f64], x: f64) -> Option<f64> {
    let n = xs.len();
    if n < 2 || ys.len() != n || !x.is_finite() {
        return None;
    }
    if x <= xs[0] {
        return Some(ys[0]);
    }
    if x >= xs[n - 1] {
        return Some(ys[n - 1]);
    }

    let hi = xs.partition_point(|&v| v < x);
    let lo = hi - 1;
    let (x0, x1, y0, y1) = (xs[lo], xs[hi], ys[lo], ys[hi]);
    debug_assert!(x0 < x && x <= x1);
    let y = (x - x0).mul_add((y1 - y0) / (x1 - x0), y0);
    // Rounding must not leave the segment's range
    Some(y.clamp(y0.min(y1), y0.max(y1)))
}

/// Sorted calibration curve with at least two finite points.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCurve {
    voltages: Vec<f64>,
    powers: Vec<f64>,
}

impl CalibrationCurve {
    /// Build from (voltage, power) points; non-finite points are dropped.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] when fewer than two finite points remain
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Result<Self> {
        let mut points: Vec<(f64, f64)> = points
            .into_iter()
            .filter(|(v, p)| v.is_finite() && p.is_finite())
            .collect();
        if points.len() < 2 {
            return Err(Error::InvalidInput(format!(
                "calibration curve needs at least 2 finite points, got {}",
                points.len()
            )));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (voltages, powers) = points.into_iter().unzip();
        Ok(Self { voltages, powers })
    }

    /// Load a curve from calibration data.
    ///
    /// # Errors
    /// Returns error if the data is unreadable, lacks voltage or power columns,
    /// or has fewer than two finite points
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = MeasurementData::load(path)?;
        let schema = data.batch().schema();
        if storage::find_column(&schema, CURVE_VOLTAGE_COLUMNS).is_none()
            || storage::find_column(&schema, CURVE_POWER_COLUMNS).is_none()
        {
            return Err(Error::SchemaError(
                "calibration data needs voltage and power columns".to_string(),
            ));
        }
        let voltages = data.column_f64(CURVE_VOLTAGE_COLUMNS)?;
        let powers = data.column_f64(CURVE_POWER_COLUMNS)?;
        Self::from_points(voltages.into_iter().zip(powers))
    }

    /// Drive voltages, ascending.
    #[must_use]
    pub fn voltages(&self) -> &[f64] {
        &self.voltages
    }

    /// Powers aligned with [`voltages`](Self::voltages).
    #[must_use]
    pub fn powers(&self) -> &[f64] {
        &self.powers
    }

    /// Interpolated power at `voltage`, clamped to the curve's ends.
    #[must_use]
    pub fn power_at(&self, voltage: f64) -> Option<f64> {
        interpolate_power(&self.voltages, &self.powers, voltage)
    }
}

/// Optical power at `drive_voltage` from the calibration stored at `path`.
///
/// Any structural problem (unreadable file, missing columns, too few points)
/// yields `None`.
#[must_use]
pub fn get_power_from_calibration(path: impl AsRef<Path>, drive_voltage: f64) -> Option<f64> {
    let path = path.as_ref();
    match CalibrationCurve::load(path) {
        Ok(curve) => curve.power_at(drive_voltage),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Calibration curve unusable");
            None
        }
    }
}
