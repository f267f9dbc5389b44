//! Chip-history enrichment
//!
//! Appends calibration columns to a chip's experiment history and writes the
//! result to a separate directory. The source history is only ever read.

use super::{CalibrationCurve, CalibrationMatcher, MatchStatus};
use crate::manifest::ChipId;
use crate::storage::{self, MeasurementData, StorageEngine};
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Columns appended to an enriched history (replaced if already present).
pub const HISTORY_CALIBRATION_COLUMNS: [&str; 3] = [
    "calibration_path",
    "calibration_time_delta_hours",
    "irradiated_power_w",
];

const RUN_ID: &[&str] = &["run_id"];
const PROCEDURE: &[&str] = &["proc", "procedure"];
const TIMESTAMP: &[&str] = &["start_time_utc", "acquired_at", "timestamp"];
const WITH_LIGHT: &[&str] = &["with_light", "has_light"];
const WAVELENGTH: &[&str] = &["wavelength_nm", "wavelength"];
const DRIVE_VOLTAGE: &[&str] = &["laser_voltage_v", "laser_voltage", "vl"];
const CHIP_GROUP: &[&str] = &["chip_group"];
const CHIP_NUMBER: &[&str] = &["chip_number"];

/// Summary of one chip-history enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    /// Chip label (`Alisson67`), or the history file stem if unknown
    pub chip: String,
    /// Where the enriched history was (or would have been) written
    pub output_path: PathBuf,
    /// Output already existed and `force` was off; nothing was done
    pub skipped_existing: bool,
    /// Light-on, non-calibration rows considered
    pub light_experiments: usize,
    /// Rows matched with a `perfect` calibration
    pub perfect: usize,
    /// Rows matched with a `stale` calibration
    pub stale: usize,
    /// Rows matched with a `future` calibration
    pub future: usize,
    /// Rows without a usable calibration
    pub missing: usize,
    /// Rows that received an irradiated power value
    pub power_interpolated: usize,
    /// One line per problematic row
    pub warnings: Vec<String>,
    /// Calibration files that could not be used
    pub errors: Vec<String>,
}

impl EnrichmentReport {
    /// Rows that received any calibration.
    #[must_use]
    pub const fn matched(&self) -> usize {
        self.perfect + self.stale + self.future
    }

    /// Count for one status.
    #[must_use]
    pub const fn count(&self, status: MatchStatus) -> usize {
        match status {
            MatchStatus::Perfect => self.perfect,
            MatchStatus::Stale => self.stale,
            MatchStatus::Future => self.future,
            MatchStatus::Missing => self.missing,
        }
    }

    /// First `limit` warnings plus the number left out.
    #[must_use]
    pub fn warnings_preview(&self, limit: usize) -> (&[String], usize) {
        let shown = limit.min(self.warnings.len());
        (&self.warnings[..shown], self.warnings.len() - shown)
    }

    fn tally(&mut self, status: MatchStatus) {
        match status {
            MatchStatus::Perfect => self.perfect += 1,
            MatchStatus::Stale => self.stale += 1,
            MatchStatus::Future => self.future += 1,
            MatchStatus::Missing => self.missing += 1,
        }
    }
}

/// Values appended for one history row.
#[derive(Debug, Default)]
struct RowCalibration {
    path: Option<String>,
    delta_hours: Option<f64>,
    power_w: Option<f64>,
}

fn chip_label(batch: &RecordBatch, history: &Path) -> String {
    let schema = batch.schema();
    let from_columns = storage::find_column(&schema, CHIP_GROUP)
        .zip(storage::find_column(&schema, CHIP_NUMBER))
        .and_then(|(g, n)| {
            let group = storage::string_values(batch, g).ok()?.into_iter().flatten().next()?;
            let number = storage::i64_values(batch, n).ok()?.into_iter().flatten().next()?;
            Some(ChipId::new(group, number))
        });
    let stem = history
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    from_columns
        .or_else(|| ChipId::parse(&stem))
        .map_or(stem, |chip| chip.to_string())
}

fn same_location(history: &Path, output: &Path) -> bool {
    let history = history
        .canonicalize()
        .unwrap_or_else(|_| history.to_path_buf());
    let output = output
        .parent()
        .and_then(|dir| dir.canonicalize().ok())
        .zip(output.file_name())
        .map_or_else(|| output.to_path_buf(), |(dir, name)| dir.join(name));
    history == output
}

fn optional<T>(
    batch: &RecordBatch,
    aliases: &[&str],
    read: fn(&RecordBatch, usize) -> Result<Vec<Option<T>>>,
) -> Result<Vec<Option<T>>> {
    match storage::find_column(&batch.schema(), aliases) {
        Some(idx) => read(batch, idx),
        None => Ok((0..batch.num_rows()).map(|_| None).collect()),
    }
}

impl CalibrationMatcher {
    /// Enrich one chip history with calibration columns.
    ///
    /// Light-on rows (excluding calibration rows) are matched against the
    /// calibration set; the history with `calibration_path`,
    /// `calibration_time_delta_hours` and `irradiated_power_w` appended is
    /// written to `output_dir/<history file name>`. An existing output is left
    /// alone unless `force` is set.
    ///
    /// # Errors
    /// Returns error if the history cannot be read, has no timestamp column,
    /// would be overwritten in place, or the output cannot be written
    pub fn enrich_chip_history(
        &self,
        history_path: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        force: bool,
        staleness_threshold_hours: f64,
    ) -> Result<EnrichmentReport> {
        let history_path = history_path.as_ref();
        if !staleness_threshold_hours.is_finite() || staleness_threshold_hours < 0.0 {
            return Err(Error::InvalidInput(format!(
                "staleness threshold must be a non-negative number of hours, got {staleness_threshold_hours}"
            )));
        }
        let file_name = history_path.file_name().ok_or_else(|| {
            Error::InvalidInput(format!("not a history file: {}", history_path.display()))
        })?;
        let output_path = output_dir.as_ref().join(file_name);
        if same_location(history_path, &output_path) {
            return Err(Error::InvalidInput(format!(
                "refusing to overwrite the source history {}",
                history_path.display()
            )));
        }

        let mut report = EnrichmentReport {
            output_path: output_path.clone(),
            ..EnrichmentReport::default()
        };
        if output_path.exists() && !force {
            report.chip = history_path
                .file_stem()
                .and_then(|s| ChipId::parse(&s.to_string_lossy()))
                .map_or_else(
                    || history_path.display().to_string(),
                    |chip| chip.to_string(),
                );
            report.skipped_existing = true;
            info!(output = %output_path.display(), "Enriched history exists, skipping");
            return Ok(report);
        }

        let data = MeasurementData::load(history_path)?;
        let batch = data.batch();
        report.chip = chip_label(batch, history_path);

        let time_idx = storage::find_column(&batch.schema(), TIMESTAMP).ok_or_else(|| {
            Error::SchemaError(format!(
                "history {} has no start_time_utc column",
                history_path.display()
            ))
        })?;
        let times = storage::timestamp_values(batch, time_idx)?;
        let run_ids = optional(batch, RUN_ID, storage::string_values)?;
        let procedures = optional(batch, PROCEDURE, storage::string_values)?;
        let with_light = optional(batch, WITH_LIGHT, storage::bool_values)?;
        let wavelengths = optional(batch, WAVELENGTH, storage::f64_values)?;
        let voltages = optional(batch, DRIVE_VOLTAGE, storage::f64_values)?;

        let mut curves: FxHashMap<PathBuf, Option<CalibrationCurve>> = FxHashMap::default();
        let mut rows = Vec::with_capacity(batch.num_rows());

        for row in 0..batch.num_rows() {
            let voltage = voltages[row].filter(|v| v.is_finite());
            let is_light = with_light[row].unwrap_or_else(|| voltage.is_some_and(|v| v > 0.0));
            let is_calibration = procedures[row].as_deref() == Some(self.procedure());
            if !is_light || is_calibration {
                rows.push(RowCalibration::default());
                continue;
            }

            report.light_experiments += 1;
            let label = run_ids[row]
                .clone()
                .unwrap_or_else(|| format!("row {row}"));

            let (Some(time), Some(wavelength)) = (times[row], wavelengths[row]) else {
                report.tally(MatchStatus::Missing);
                let what = if times[row].is_none() { "timestamp" } else { "wavelength" };
                warn!(run_id = %label, "Light experiment has no {what}");
                report.warnings.push(format!("{label}: no {what}"));
                rows.push(RowCalibration::default());
                continue;
            };

            let found = self.find_calibration(time, wavelength, staleness_threshold_hours);
            report.tally(found.status());
            if let Some(message) = found.warning() {
                warn!(run_id = %label, status = %found.status(), "{message}");
                report.warnings.push(format!("{label}: {} ({message})", found.status()));
            }

            let Some(calibration) = found.calibration() else {
                rows.push(RowCalibration::default());
                continue;
            };
            let mut values = RowCalibration {
                path: Some(calibration.path().display().to_string()),
                delta_hours: found.time_delta_hours(),
                power_w: None,
            };

            match voltage {
                None => report.warnings.push(format!("{label}: no drive voltage")),
                Some(v) => {
                    let curve = curves
                        .entry(calibration.path().to_path_buf())
                        .or_insert_with(|| match CalibrationCurve::load(calibration.path()) {
                            Ok(curve) => Some(curve),
                            Err(e) => {
                                warn!(calibration = calibration.run_id(), error = %e, "Calibration curve unusable");
                                report.errors.push(format!(
                                    "{}: {e}",
                                    calibration.path().display()
                                ));
                                None
                            }
                        });
                    values.power_w = curve.as_ref().and_then(|c| c.power_at(v));
                    if values.power_w.is_some() {
                        report.power_interpolated += 1;
                    } else {
                        report
                            .warnings
                            .push(format!("{label}: no power from calibration {}", calibration.run_id()));
                    }
                }
            }
            debug!(run_id = %label, status = %found.status(), power_w = ?values.power_w, "Row matched");
            rows.push(values);
        }

        let enriched = append_calibration_columns(batch, rows)?;
        StorageEngine::new(vec![enriched]).write_parquet(&output_path)?;

        info!(
            chip = %report.chip,
            light = report.light_experiments,
            perfect = report.perfect,
            stale = report.stale,
            future = report.future,
            missing = report.missing,
            power = report.power_interpolated,
            output = %output_path.display(),
            "Enriched chip history"
        );
        Ok(report)
    }

    /// Enrich several chip histories independently.
    ///
    /// One result per input, in input order; a failing chip does not affect others.
    pub fn enrich_chip_histories<P>(
        &self,
        history_paths: &[P],
        output_dir: impl AsRef<Path>,
        force: bool,
        staleness_threshold_hours: f64,
    ) -> Vec<Result<EnrichmentReport>>
    where
        P: AsRef<Path> + Sync,
    {
        let output_dir = output_dir.as_ref();
        let enrich = |path: &P| {
            let result = self.enrich_chip_history(path, output_dir, force, staleness_threshold_hours);
            if let Err(e) = &result {
                warn!(history = %path.as_ref().display(), error = %e, "Enrichment failed");
            }
            result
        };

        #[cfg(feature = "rayon")]
        let reports = {
            use rayon::prelude::*;
            history_paths.par_iter().map(enrich).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let reports = history_paths.iter().map(enrich).collect();
        reports
    }
}

fn append_calibration_columns(batch: &RecordBatch, rows: Vec<RowCalibration>) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<FieldRef> = Vec::with_capacity(schema.fields().len() + 3);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());
    for (idx, field) in schema.fields().iter().enumerate() {
        if HISTORY_CALIBRATION_COLUMNS.contains(&field.name().as_str()) {
            continue;
        }
        fields.push(Arc::clone(field));
        columns.push(Arc::clone(batch.column(idx)));
    }

    let mut paths = Vec::with_capacity(rows.len());
    let mut deltas = Vec::with_capacity(rows.len());
    let mut powers = Vec::with_capacity(rows.len());
    for row in rows {
        paths.push(row.path);
        deltas.push(row.delta_hours);
        powers.push(row.power_w);
    }

    let [path_col, delta_col, power_col] = HISTORY_CALIBRATION_COLUMNS;
    fields.push(Arc::new(Field::new(path_col, DataType::Utf8, true)));
    columns.push(Arc::new(StringArray::from(paths)));
    fields.push(Arc::new(Field::new(delta_col, DataType::Float64, true)));
    columns.push(Arc::new(Float64Array::from(deltas)));
    fields.push(Arc::new(Field::new(power_col, DataType::Float64, true)));
    columns.push(Arc::new(Float64Array::from(powers)));

    let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}
