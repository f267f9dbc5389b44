//! Manifest: the index of staged measurements
//!
//! The manifest is produced by the upstream staging step and is read-only here.
//! Loading keeps the processable rows (`ok` / `skipped`), resolves partition
//! paths against the stage root, and assigns per-(chip, procedure) sequence
//! numbers by acquisition time.
//!
//! ```text
//! manifest.parquet ──> Manifest ──┬─> filter(procedures, chips)  ─> extraction
//!                                 └─> calibration_records(name)  ─> calibration
//! ```

mod record;

pub use record::{ChipId, MeasurementRecord, MeasurementRecordBuilder, MeasurementStatus};

use crate::config::Selection;
use crate::storage::{self, StorageEngine};
use crate::{Error, Result};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

const RUN_ID: &[&str] = &["run_id"];
const PROCEDURE: &[&str] = &["proc", "procedure"];
const CHIP_GROUP: &[&str] = &["chip_group"];
const CHIP_NUMBER: &[&str] = &["chip_number"];
const TIMESTAMP: &[&str] = &["start_time_utc", "acquired_at", "timestamp"];
const DATE_LOCAL: &[&str] = &["date_local"];
const PATH: &[&str] = &["path", "parquet_path"];
const STATUS: &[&str] = &["status"];

/// Processable rows of the measurement index.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    records: Vec<MeasurementRecord>,
    rejected: usize,
}

impl Manifest {
    /// Load the manifest Parquet file.
    ///
    /// # Errors
    /// [`Error::ManifestMissing`] if the file does not exist; storage or schema
    /// errors if it cannot be read
    pub fn load(path: impl AsRef<Path>, stage_root: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ManifestMissing(path.to_path_buf()));
        }
        let storage = StorageEngine::load_parquet(path)?;
        let manifest = Self::from_batches(storage.batches(), stage_root.as_ref())?;
        info!(
            path = %path.display(),
            rows = manifest.len(),
            rejected = manifest.rejected,
            "Loaded manifest"
        );
        Ok(manifest)
    }

    /// Build from in-memory record batches.
    ///
    /// # Errors
    /// Returns [`Error::SchemaError`] if a required column is absent
    pub fn from_batches(batches: &[RecordBatch], stage_root: &Path) -> Result<Self> {
        let mut records = Vec::new();
        let mut rejected = 0;
        for batch in batches {
            rejected += read_batch(batch, stage_root, &mut records)?;
        }
        let mut manifest = Self::from_records(records);
        manifest.rejected += rejected;
        Ok(manifest)
    }

    /// Build from records, dropping non-processable ones and assigning sequence numbers.
    #[must_use]
    pub fn from_records(records: Vec<MeasurementRecord>) -> Self {
        let total = records.len();
        let mut records: Vec<MeasurementRecord> = records
            .into_iter()
            .filter(|r| r.status().is_processable())
            .collect();
        let rejected = total - records.len();

        records.sort_by(|a, b| {
            (a.chip(), a.procedure(), a.acquired_at(), a.run_id())
                .cmp(&(b.chip(), b.procedure(), b.acquired_at(), b.run_id()))
        });
        let mut next_seq: FxHashMap<(ChipId, String), u64> = FxHashMap::default();
        for record in &mut records {
            let seq = next_seq
                .entry((record.chip().clone(), record.procedure().to_string()))
                .or_insert(0);
            record.set_seq_num(*seq);
            *seq += 1;
        }

        Self { records, rejected }
    }

    /// All processable records, ordered by (chip, procedure, time).
    #[must_use]
    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    /// Number of processable records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no processable records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows dropped for a non-processable status (or missing required values).
    #[must_use]
    pub const fn rejected_count(&self) -> usize {
        self.rejected
    }

    /// Distinct procedure names.
    #[must_use]
    pub fn procedures(&self) -> BTreeSet<&str> {
        self.records.iter().map(MeasurementRecord::procedure).collect()
    }

    /// Records passing both selections.
    #[must_use]
    pub fn filter(
        &self,
        procedures: &Selection<String>,
        chips: &Selection<ChipId>,
    ) -> Vec<&MeasurementRecord> {
        self.records
            .iter()
            .filter(|r| match procedures {
                Selection::All => true,
                Selection::Only(names) => names.iter().any(|n| n == r.procedure()),
            })
            .filter(|r| chips.matches(r.chip()))
            .collect()
    }

    /// Records of the calibration procedure.
    #[must_use]
    pub fn calibration_records(&self, procedure: &str) -> Vec<&MeasurementRecord> {
        self.records
            .iter()
            .filter(|r| r.procedure() == procedure)
            .collect()
    }
}

fn required(batch: &RecordBatch, aliases: &[&str]) -> Result<usize> {
    storage::find_column(&batch.schema(), aliases).ok_or_else(|| {
        Error::SchemaError(format!("Manifest is missing required column {}", aliases[0]))
    })
}

/// Append the batch's rows to `out`; returns how many rows were unusable.
fn read_batch(
    batch: &RecordBatch,
    stage_root: &Path,
    out: &mut Vec<MeasurementRecord>,
) -> Result<usize> {
    let run_id_idx = required(batch, RUN_ID)?;
    let proc_idx = required(batch, PROCEDURE)?;
    let group_idx = required(batch, CHIP_GROUP)?;
    let number_idx = required(batch, CHIP_NUMBER)?;
    let time_idx = required(batch, TIMESTAMP)?;
    let path_idx = required(batch, PATH)?;
    let schema = batch.schema();
    let date_idx = storage::find_column(&schema, DATE_LOCAL);
    let status_idx = storage::find_column(&schema, STATUS);

    let run_ids = storage::string_values(batch, run_id_idx)?;
    let procs = storage::string_values(batch, proc_idx)?;
    let groups = storage::string_values(batch, group_idx)?;
    let numbers = storage::i64_values(batch, number_idx)?;
    let times = storage::timestamp_values(batch, time_idx)?;
    let paths = storage::string_values(batch, path_idx)?;
    let dates = date_idx
        .map(|idx| storage::string_values(batch, idx))
        .transpose()?;
    let statuses = status_idx
        .map(|idx| storage::string_values(batch, idx))
        .transpose()?;

    let core: BTreeSet<usize> = [run_id_idx, proc_idx, group_idx, number_idx, time_idx, path_idx]
        .into_iter()
        .chain(date_idx)
        .chain(status_idx)
        .collect();
    let extras = extra_columns(batch, &core);

    let mut unusable = 0;
    for row in 0..batch.num_rows() {
        let (Some(run_id), Some(procedure), Some(group), Some(number), Some(time), Some(path)) = (
            run_ids[row].as_ref(),
            procs[row].as_ref(),
            groups[row].as_ref(),
            numbers[row],
            times[row],
            paths[row].as_ref(),
        ) else {
            warn!(row, "Manifest row lacks a required value; ignoring it");
            unusable += 1;
            continue;
        };

        let status = statuses
            .as_ref()
            .and_then(|s| s[row].as_deref())
            .map_or(MeasurementStatus::Ok, MeasurementStatus::parse);

        let mut builder = MeasurementRecord::builder(
            run_id.as_str(),
            procedure.as_str(),
            ChipId::new(group.as_str(), number),
            time,
            stage_root.join(path),
        )
        .status(status);
        if let Some(date) = dates.as_ref().and_then(|d| d[row].clone()) {
            builder = builder.date_local(date);
        }
        for (name, values) in &extras {
            builder = builder.extra(name.clone(), values[row].clone());
        }
        out.push(builder.build());
    }
    Ok(unusable)
}

/// Convert non-core columns to JSON values, column by column.
fn extra_columns(
    batch: &RecordBatch,
    core: &BTreeSet<usize>,
) -> BTreeMap<String, Vec<serde_json::Value>> {
    let schema = batch.schema();
    let mut extras = BTreeMap::new();
    for (idx, field) in schema.fields().iter().enumerate() {
        if core.contains(&idx) {
            continue;
        }
        let values = match field.data_type() {
            DataType::Boolean => storage::bool_values(batch, idx)
                .map(|v| v.into_iter().map(|b| b.map_or(serde_json::Value::Null, Into::into)).collect()),
            dt if dt.is_integer() => storage::i64_values(batch, idx)
                .map(|v| v.into_iter().map(|n| n.map_or(serde_json::Value::Null, Into::into)).collect()),
            dt if dt.is_floating() => storage::f64_values(batch, idx).map(|v| {
                v.into_iter()
                    .map(|x| {
                        x.and_then(serde_json::Number::from_f64)
                            .map_or(serde_json::Value::Null, serde_json::Value::Number)
                    })
                    .collect()
            }),
            _ => storage::string_values(batch, idx)
                .map(|v| v.into_iter().map(|s| s.map_or(serde_json::Value::Null, Into::into)).collect()),
        };
        match values {
            Ok(values) => {
                extras.insert(field.name().clone(), values);
            }
            Err(e) => debug!(column = %field.name(), error = %e, "Skipping unreadable manifest column"),
        }
    }
    extras
}
