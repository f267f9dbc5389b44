//! Laser calibration matching
//!
//! Light-on experiments are paired with the voltage→power calibration curve
//! that best describes the laser at the time of the experiment:
//!
//! ```text
//!             same wavelength only
//!   ──cal──────cal────────●────────cal──►  time
//!               │◄─ age ─►│
//!        previous (perfect/stale)   next (future)
//! ```
//!
//! A previous calibration within the staleness threshold is `perfect`, an
//! older one is `stale`. With no previous one, the nearest later calibration is
//! used and reported as `future`. No calibration at the wavelength is `missing`.
//!
//! ## Usage
//!
//! ```rust
//! use chipmetrics::calibration::{CalibrationMatcher, CalibrationRecord, MatchStatus};
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
//! let matcher = CalibrationMatcher::new(vec![
//!     CalibrationRecord::new("cal-450", 450.0, t0, "cal/450.parquet"),
//! ]);
//!
//! let found = matcher.find_calibration(t0 + Duration::hours(2), 450.0, 24.0);
//! assert_eq!(found.status(), MatchStatus::Perfect);
//! assert_eq!(found.time_delta_hours(), Some(2.0));
//!
//! let missing = matcher.find_calibration(t0, 500.0, 24.0);
//! assert_eq!(missing.status(), MatchStatus::Missing);
//! ```

mod enrich;
mod interp;

pub use enrich::{EnrichmentReport, HISTORY_CALIBRATION_COLUMNS};
pub use interp::{get_power_from_calibration, interpolate_power, CalibrationCurve};

use crate::config::DEFAULT_CALIBRATION_PROCEDURE;
use crate::manifest::{Manifest, MeasurementRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest extra keys that may carry a calibration's wavelength.
const WAVELENGTH_KEYS: &[&str] = &["wavelength_nm", "wavelength", "wl_nm"];

/// One calibration measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    run_id: String,
    wavelength_nm: f64,
    acquired_at: DateTime<Utc>,
    path: PathBuf,
}

impl CalibrationRecord {
    /// Create a calibration record.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        wavelength_nm: f64,
        acquired_at: DateTime<Utc>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            wavelength_nm,
            acquired_at,
            path: path.into(),
        }
    }

    /// Calibration from a manifest row; `None` without a finite wavelength.
    #[must_use]
    pub fn from_measurement(record: &MeasurementRecord) -> Option<Self> {
        let wavelength = WAVELENGTH_KEYS.iter().find_map(|k| record.extra_f64(k))?;
        Some(Self::new(
            record.run_id(),
            wavelength,
            record.acquired_at(),
            record.path(),
        ))
    }

    /// Run ID of the calibration measurement.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Laser wavelength (nm).
    #[must_use]
    pub const fn wavelength_nm(&self) -> f64 {
        self.wavelength_nm
    }

    /// Acquisition time.
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Path to the voltage→power curve data.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Quality of a calibration match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    /// Previous calibration within the staleness threshold
    Perfect,
    /// Previous calibration older than the threshold (still used)
    Stale,
    /// Only a later calibration exists (still used)
    Future,
    /// No usable calibration at this wavelength
    Missing,
}

impl MatchStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Perfect => "perfect",
            Self::Stale => "stale",
            Self::Future => "future",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one calibration lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationMatch {
    calibration: Option<CalibrationRecord>,
    time_delta_hours: Option<f64>,
    status: MatchStatus,
    warning: Option<String>,
}

impl CalibrationMatch {
    fn found(calibration: &CalibrationRecord, delta_hours: f64, status: MatchStatus) -> Self {
        Self {
            calibration: Some(calibration.clone()),
            time_delta_hours: Some(delta_hours),
            status,
            warning: None,
        }
    }

    fn missing(warning: String) -> Self {
        Self {
            calibration: None,
            time_delta_hours: None,
            status: MatchStatus::Missing,
            warning: Some(warning),
        }
    }

    /// Matched calibration, if any.
    #[must_use]
    pub const fn calibration(&self) -> Option<&CalibrationRecord> {
        self.calibration.as_ref()
    }

    /// Experiment time minus calibration time, in hours.
    ///
    /// Negative when the calibration was taken after the experiment.
    #[must_use]
    pub const fn time_delta_hours(&self) -> Option<f64> {
        self.time_delta_hours
    }

    /// Match quality.
    #[must_use]
    pub const fn status(&self) -> MatchStatus {
        self.status
    }

    /// Diagnostic text for non-perfect matches.
    #[must_use]
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Whether a calibration was found.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.calibration.is_some()
    }
}

#[allow(clippy::cast_precision_loss)]
fn hours_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_microseconds().map_or_else(
        || (later - earlier).num_seconds() as f64 / 3600.0,
        |us| us as f64 / 3_600_000_000.0,
    )
}

/// Time-sorted calibration set, immutable once built.
#[derive(Debug, Clone)]
pub struct CalibrationMatcher {
    records: Vec<CalibrationRecord>,
    procedure: String,
}

impl Default for CalibrationMatcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CalibrationMatcher {
    /// Build from explicit records.
    #[must_use]
    pub fn new(mut records: Vec<CalibrationRecord>) -> Self {
        records.sort_by(|a, b| {
            a.acquired_at
                .cmp(&b.acquired_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Self {
            records,
            procedure: DEFAULT_CALIBRATION_PROCEDURE.to_string(),
        }
    }

    /// Build from the manifest rows of `procedure`.
    ///
    /// Calibration rows without a wavelength are ignored with a warning.
    #[must_use]
    pub fn from_manifest(manifest: &Manifest, procedure: &str) -> Self {
        let rows = manifest.calibration_records(procedure);
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match CalibrationRecord::from_measurement(row) {
                Some(record) => records.push(record),
                None => warn!(run_id = row.run_id(), "Calibration row has no wavelength, ignored"),
            }
        }
        let mut matcher = Self::new(records);
        matcher.procedure = procedure.to_string();
        info!(
            calibrations = matcher.len(),
            wavelengths = ?matcher.available_wavelengths(),
            "Loaded calibration set"
        );
        matcher
    }

    /// Procedure name identifying calibration rows in chip histories.
    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Calibrations in time order.
    #[must_use]
    pub fn records(&self) -> &[CalibrationRecord] {
        &self.records
    }

    /// Number of calibrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct wavelengths, ascending.
    #[must_use]
    pub fn available_wavelengths(&self) -> Vec<f64> {
        let mut wavelengths: Vec<f64> = self.records.iter().map(|r| r.wavelength_nm).collect();
        wavelengths.sort_by(f64::total_cmp);
        wavelengths.dedup();
        wavelengths
    }

    /// Find the calibration for an experiment at `time` and `wavelength_nm`.
    ///
    /// Wavelengths must match exactly. An age equal to the threshold is still
    /// `perfect`.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn find_calibration(
        &self,
        time: DateTime<Utc>,
        wavelength_nm: f64,
        staleness_threshold_hours: f64,
    ) -> CalibrationMatch {
        let candidates: Vec<&CalibrationRecord> = self
            .records
            .iter()
            .filter(|r| r.wavelength_nm == wavelength_nm)
            .collect();

        if candidates.is_empty() {
            let available = self.available_wavelengths();
            debug!(wavelength_nm, ?available, "No calibration at wavelength");
            return CalibrationMatch::missing(format!(
                "no calibration at {wavelength_nm} nm (available: {available:?})"
            ));
        }

        // Candidates are time-sorted.
        let split = candidates.partition_point(|r| r.acquired_at < time);

        if let Some(previous) = split.checked_sub(1).map(|i| candidates[i]) {
            let age = hours_between(time, previous.acquired_at);
            if age <= staleness_threshold_hours {
                return CalibrationMatch::found(previous, age, MatchStatus::Perfect);
            }
            let mut found = CalibrationMatch::found(previous, age, MatchStatus::Stale);
            found.warning = Some(format!(
                "calibration {} is {age:.1} h old (threshold {staleness_threshold_hours} h)",
                previous.run_id
            ));
            return found;
        }

        if let Some(next) = candidates[split..].iter().find(|r| r.acquired_at > time) {
            let delta = -hours_between(next.acquired_at, time);
            let mut found = CalibrationMatch::found(next, delta, MatchStatus::Future);
            found.warning = Some(format!(
                "calibration {} was taken {:.1} h after the experiment",
                next.run_id,
                delta.abs()
            ));
            return found;
        }

        CalibrationMatch::missing(format!(
            "calibration at {wavelength_nm} nm shares the experiment timestamp {time}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ChipId;
    use chrono::{Duration, TimeZone};

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    fn matcher() -> CalibrationMatcher {
        CalibrationMatcher::new(vec![CalibrationRecord::new("cal", 450.0, t(10), "cal.parquet")])
    }

    #[test]
    fn test_perfect_previous_calibration() {
        let m = matcher().find_calibration(t(12), 450.0, 24.0);
        assert_eq!(m.status(), MatchStatus::Perfect);
        assert_eq!(m.time_delta_hours(), Some(2.0));
        assert!(m.warning().is_none());
        assert_eq!(m.calibration().unwrap().run_id(), "cal");
    }

    #[test]
    fn test_future_calibration_has_negative_delta() {
        let m = matcher().find_calibration(t(9), 450.0, 24.0);
        assert_eq!(m.status(), MatchStatus::Future);
        assert_eq!(m.time_delta_hours(), Some(-1.0));
        assert!(m.is_usable());
    }

    #[test]
    fn test_missing_wavelength_lists_available() {
        let m = matcher().find_calibration(t(12), 500.0, 24.0);
        assert_eq!(m.status(), MatchStatus::Missing);
        assert!(m.calibration().is_none());
        assert!(m.warning().unwrap().contains("450"));
    }

    #[test]
    fn test_stale_after_threshold() {
        let m = matcher().find_calibration(t(10) + Duration::hours(30), 450.0, 24.0);
        assert_eq!(m.status(), MatchStatus::Stale);
        assert_eq!(m.time_delta_hours(), Some(30.0));
        assert!(m.is_usable());
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let at = matcher().find_calibration(t(10) + Duration::hours(24), 450.0, 24.0);
        assert_eq!(at.status(), MatchStatus::Perfect);
        let past = matcher().find_calibration(
            t(10) + Duration::hours(24) + Duration::seconds(1),
            450.0,
            24.0,
        );
        assert_eq!(past.status(), MatchStatus::Stale);
    }

    #[test]
    fn test_most_recent_previous_wins() {
        let matcher = CalibrationMatcher::new(vec![
            CalibrationRecord::new("late", 450.0, t(11), "b"),
            CalibrationRecord::new("early", 450.0, t(8), "a"),
            CalibrationRecord::new("other", 520.0, t(11), "c"),
        ]);
        let m = matcher.find_calibration(t(12), 450.0, 24.0);
        assert_eq!(m.calibration().unwrap().run_id(), "late");
        assert_eq!(matcher.available_wavelengths(), vec![450.0, 520.0]);
    }

    #[test]
    fn test_exact_timestamp_collision_is_missing() {
        let m = matcher().find_calibration(t(10), 450.0, 24.0);
        assert_eq!(m.status(), MatchStatus::Missing);
        assert!(m.warning().is_some());
    }

    #[test]
    fn test_from_manifest_skips_rows_without_wavelength() {
        let rows = vec![
            MeasurementRecord::builder("c1", "calibration", ChipId::new("L", 0), t(8), "c1")
                .extra("wavelength_nm", 450.0)
                .build(),
            MeasurementRecord::builder("c2", "calibration", ChipId::new("L", 0), t(9), "c2").build(),
            MeasurementRecord::builder("x", "IVg", ChipId::new("A", 1), t(9), "x").build(),
        ];
        let manifest = Manifest::from_records(rows);
        let matcher = CalibrationMatcher::from_manifest(&manifest, "calibration");
        assert_eq!(matcher.len(), 1);
        assert_eq!(matcher.records()[0].run_id(), "c1");
        assert_eq!(matcher.procedure(), "calibration");
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(MatchStatus::Future.to_string(), "future");
        assert_eq!(serde_json::to_string(&MatchStatus::Stale).unwrap(), "\"stale\"");
    }
}
