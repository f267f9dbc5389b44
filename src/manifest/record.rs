//! Measurement Record - one staged measurement from the manifest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Staging outcome of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementStatus {
    /// Staged cleanly.
    Ok,
    /// Staged, but some optional step was skipped upstream.
    Skipped,
    /// Rejected by schema validation; never processed.
    Rejected,
}

impl MeasurementStatus {
    /// Parse a manifest status string. Unknown values are treated as rejected.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ok" | "success" => Self::Ok,
            "skipped" | "skip" => Self::Skipped,
            _ => Self::Rejected,
        }
    }

    /// Whether rows with this status feed extraction.
    #[must_use]
    pub const fn is_processable(self) -> bool {
        matches!(self, Self::Ok | Self::Skipped)
    }
}

/// Physical device identity: `(group, number)`, displayed as `Alisson67`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChipId {
    /// Chip group (wafer / batch name)
    pub group: String,
    /// Chip number within the group
    pub number: i64,
}

impl ChipId {
    /// Create a chip identity.
    #[must_use]
    pub fn new(group: impl Into<String>, number: i64) -> Self {
        Self {
            group: group.into(),
            number,
        }
    }

    /// Parse a `<group><number>` label such as `Alisson67` or `Alisson67_history`.
    ///
    /// Anything after the first `_` is ignored.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.split('_').next()?;
        let digits_at = label.find(|c: char| c.is_ascii_digit())?;
        let (group, number) = label.split_at(digits_at);
        if group.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(Self::new(group, number.parse().ok()?))
    }
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.group, self.number)
    }
}

/// One staged measurement.
///
/// The fields every consumer relies on are typed; schema-optional columns
/// (wavelength, drive voltage, sweep settings, ...) live in [`extra`](Self::extra).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    run_id: String,
    procedure: String,
    chip: ChipId,
    acquired_at: DateTime<Utc>,
    date_local: Option<String>,
    path: PathBuf,
    status: MeasurementStatus,
    seq_num: u64,
    extra: BTreeMap<String, serde_json::Value>,
}

impl MeasurementRecord {
    /// Create a builder with the required fields.
    #[must_use]
    pub fn builder(
        run_id: impl Into<String>,
        procedure: impl Into<String>,
        chip: ChipId,
        acquired_at: DateTime<Utc>,
        path: impl Into<PathBuf>,
    ) -> MeasurementRecordBuilder {
        MeasurementRecordBuilder::new(run_id, procedure, chip, acquired_at, path)
    }

    /// Unique run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Procedure name.
    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Chip identity.
    #[must_use]
    pub const fn chip(&self) -> &ChipId {
        &self.chip
    }

    /// Acquisition timestamp (UTC).
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Local acquisition date as staged, if present.
    #[must_use]
    pub fn date_local(&self) -> Option<&str> {
        self.date_local.as_deref()
    }

    /// Partition path of the measurement data.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging status.
    #[must_use]
    pub const fn status(&self) -> MeasurementStatus {
        self.status
    }

    /// Position within the chip's history of this procedure (0-based, by time).
    #[must_use]
    pub const fn seq_num(&self) -> u64 {
        self.seq_num
    }

    pub(crate) fn set_seq_num(&mut self, seq_num: u64) {
        self.seq_num = seq_num;
    }

    /// All schema-optional fields.
    #[must_use]
    pub const fn extra(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extra
    }

    /// Raw optional field.
    #[must_use]
    pub fn extra_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key).filter(|v| !v.is_null())
    }

    /// Optional numeric field; numeric strings are accepted.
    #[must_use]
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        let value = match self.extra_value(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    /// Optional boolean field; `"true"`/`"false"` and 0/1 are accepted.
    #[must_use]
    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        match self.extra_value(key)? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0),
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Optional string field.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra_value(key)?.as_str()
    }
}

/// Builder for `MeasurementRecord`.
#[derive(Debug)]
pub struct MeasurementRecordBuilder {
    record: MeasurementRecord,
}

impl MeasurementRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        procedure: impl Into<String>,
        chip: ChipId,
        acquired_at: DateTime<Utc>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            record: MeasurementRecord {
                run_id: run_id.into(),
                procedure: procedure.into(),
                chip,
                acquired_at,
                date_local: None,
                path: path.into(),
                status: MeasurementStatus::Ok,
                seq_num: 0,
                extra: BTreeMap::new(),
            },
        }
    }

    /// Set the local acquisition date.
    #[must_use]
    pub fn date_local(mut self, date: impl Into<String>) -> Self {
        self.record.date_local = Some(date.into());
        self
    }

    /// Set the staging status.
    #[must_use]
    pub const fn status(mut self, status: MeasurementStatus) -> Self {
        self.record.status = status;
        self
    }

    /// Set the sequence number.
    #[must_use]
    pub const fn seq_num(mut self, seq_num: u64) -> Self {
        self.record.seq_num = seq_num;
        self
    }

    /// Add an optional field.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.record.extra.insert(key.into(), value.into());
        self
    }

    /// Build the `MeasurementRecord`.
    #[must_use]
    pub fn build(self) -> MeasurementRecord {
        self.record
    }
}
