//! Metrics Store - persisted derived metrics with merge-on-rerun
//!
//! The store is one Parquet file. Re-running an extraction merges new rows into
//! the existing ones by [`MetricKey`]; on conflict the row with the newer
//! extraction timestamp wins (the incoming row on a tie). Rows are written sorted
//! by (chip group, chip number, procedure, seq_num) so runs of equal values
//! compress well.

use super::{DerivedMetric, DerivedMetricBuilder, MetricKey, MetricValue};
use crate::manifest::ChipId;
use crate::storage::{self, StorageEngine};
use crate::{Error, Result};
use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Counts from one [`MetricsStore::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Keys not previously present
    pub inserted: usize,
    /// Existing rows superseded
    pub replaced: usize,
    /// Incoming rows older than the stored row, dropped
    pub ignored: usize,
}

/// Arrow schema of the metrics store file.
#[must_use]
pub fn metrics_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("run_id", DataType::Utf8, false),
        Field::new("chip_group", DataType::Utf8, false),
        Field::new("chip_number", DataType::Int64, false),
        Field::new("procedure", DataType::Utf8, false),
        Field::new("seq_num", DataType::Int64, false),
        Field::new("metric_name", DataType::Utf8, false),
        Field::new("metric_category", DataType::Utf8, false),
        Field::new("value_float", DataType::Float64, true),
        Field::new("value_str", DataType::Utf8, true),
        Field::new("value_json", DataType::Utf8, true),
        Field::new("unit", DataType::Utf8, true),
        Field::new("extraction_method", DataType::Utf8, false),
        Field::new("extraction_version", DataType::Utf8, false),
        Field::new(
            "extraction_timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("confidence", DataType::Float64, false),
        Field::new("flags", DataType::Utf8, true),
    ]))
}

/// Derived metrics keyed by (run_id, metric_name, procedure, seq_num).
#[derive(Debug, Default, Clone)]
pub struct MetricsStore {
    metrics: Vec<DerivedMetric>,
    index: FxHashMap<MetricKey, usize>,
}

impl MetricsStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from metrics, resolving duplicate keys.
    #[must_use]
    pub fn from_metrics(metrics: Vec<DerivedMetric>) -> Self {
        let mut store = Self::new();
        store.merge(metrics);
        store
    }

    /// Load the store file; a missing file is an empty store.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No metrics store yet");
            return Ok(Self::new());
        }
        let storage = StorageEngine::load_parquet(path)?;
        let mut metrics = Vec::with_capacity(storage.num_rows());
        for batch in storage.batches() {
            metrics.extend(metrics_from_batch(batch)?);
        }
        let store = Self::from_metrics(metrics);
        info!(path = %path.display(), metrics = store.len(), "Loaded metrics store");
        Ok(store)
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Get the number of metrics in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// All metrics, in store order.
    #[must_use]
    pub fn metrics(&self) -> &[DerivedMetric] {
        &self.metrics
    }

    /// Look up a metric by key.
    #[must_use]
    pub fn get(&self, key: &MetricKey) -> Option<&DerivedMetric> {
        self.index.get(key).map(|&i| &self.metrics[i])
    }

    /// Distinct run IDs with at least one metric.
    #[must_use]
    pub fn run_ids(&self) -> FxHashSet<&str> {
        self.metrics.iter().map(DerivedMetric::run_id).collect()
    }

    /// Distinct `(run_id, extraction_method)` pairs.
    #[must_use]
    pub fn run_methods(&self) -> FxHashSet<(&str, &str)> {
        self.metrics
            .iter()
            .map(|m| (m.run_id(), m.extraction_method()))
            .collect()
    }

    /// Metrics of one run, ordered by metric name.
    #[must_use]
    pub fn get_metrics_for_run(&self, run_id: &str) -> Vec<&DerivedMetric> {
        let mut metrics: Vec<&DerivedMetric> =
            self.metrics.iter().filter(|m| m.run_id() == run_id).collect();
        metrics.sort_by(|a, b| a.metric_name().cmp(b.metric_name()));
        metrics
    }

    /// Merge metrics into the store; the newest extraction wins per key.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = DerivedMetric>) -> MergeStats {
        let mut stats = MergeStats::default();
        for metric in incoming {
            let key = metric.key();
            match self.index.get(&key) {
                Some(&i) => {
                    if metric.extraction_timestamp() >= self.metrics[i].extraction_timestamp() {
                        self.metrics[i] = metric;
                        stats.replaced += 1;
                    } else {
                        stats.ignored += 1;
                    }
                }
                None => {
                    self.index.insert(key, self.metrics.len());
                    self.metrics.push(metric);
                    stats.inserted += 1;
                }
            }
        }
        stats
    }

    /// Sort by (chip group, chip number, procedure, seq_num, metric name, run).
    pub fn sort(&mut self) {
        self.metrics.sort_by(|a, b| {
            (a.chip(), a.procedure(), a.seq_num(), a.metric_name(), a.run_id())
                .cmp(&(b.chip(), b.procedure(), b.seq_num(), b.metric_name(), b.run_id()))
        });
        self.index = self
            .metrics
            .iter()
            .enumerate()
            .map(|(i, m)| (m.key(), i))
            .collect();
    }

    /// Convert to one Arrow record batch.
    ///
    /// # Errors
    /// Returns error if a JSON value cannot be serialized or the batch is invalid
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let ms = &self.metrics;
        let mut value_float = Vec::with_capacity(ms.len());
        let mut value_str = Vec::with_capacity(ms.len());
        let mut value_json = Vec::with_capacity(ms.len());
        for m in ms {
            match m.value() {
                MetricValue::Float(v) => {
                    value_float.push(Some(*v));
                    value_str.push(None);
                    value_json.push(None);
                }
                MetricValue::Text(s) => {
                    value_float.push(None);
                    value_str.push(Some(s.clone()));
                    value_json.push(None);
                }
                MetricValue::Json(j) => {
                    value_float.push(None);
                    value_str.push(None);
                    value_json.push(Some(serde_json::to_string(j)?));
                }
            }
        }

        let utf8 = |f: fn(&DerivedMetric) -> &str| -> ArrayRef {
            Arc::new(StringArray::from_iter_values(ms.iter().map(f)))
        };
        let opt_utf8 = |f: fn(&DerivedMetric) -> Option<&str>| -> ArrayRef {
            Arc::new(ms.iter().map(f).collect::<StringArray>())
        };
        let seq_nums = ms
            .iter()
            .map(|m| {
                i64::try_from(m.seq_num())
                    .map_err(|_| Error::Other(format!("seq_num {} overflows i64", m.seq_num())))
            })
            .collect::<Result<Vec<i64>>>()?;

        let columns: Vec<ArrayRef> = vec![
            utf8(DerivedMetric::run_id),
            Arc::new(StringArray::from_iter_values(ms.iter().map(|m| m.chip().group.as_str()))),
            Arc::new(Int64Array::from_iter_values(ms.iter().map(|m| m.chip().number))),
            utf8(DerivedMetric::procedure),
            Arc::new(Int64Array::from(seq_nums)),
            utf8(DerivedMetric::metric_name),
            utf8(DerivedMetric::metric_category),
            Arc::new(Float64Array::from(value_float)),
            Arc::new(StringArray::from(value_str)),
            Arc::new(StringArray::from(value_json)),
            opt_utf8(DerivedMetric::unit),
            utf8(DerivedMetric::extraction_method),
            utf8(DerivedMetric::extraction_version),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(
                    ms.iter().map(|m| m.extraction_timestamp().timestamp_micros()),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(Float64Array::from_iter_values(ms.iter().map(DerivedMetric::confidence))),
            opt_utf8(DerivedMetric::flags),
        ];

        Ok(RecordBatch::try_new(metrics_schema(), columns)?)
    }

    /// Sort and write the store to `path` (atomically replaced).
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.sort();
        let batch = self.to_record_batch()?;
        StorageEngine::new(vec![batch]).write_parquet(path.as_ref())?;
        info!(path = %path.as_ref().display(), metrics = self.len(), "Saved metrics store");
        Ok(())
    }
}

fn column(batch: &RecordBatch, name: &str) -> Result<usize> {
    batch
        .schema()
        .index_of(name)
        .map_err(|_| Error::SchemaError(format!("Metrics store is missing column {name}")))
}

fn required<T>(values: Vec<Option<T>>, name: &str) -> Result<Vec<T>> {
    values
        .into_iter()
        .map(|v| v.ok_or_else(|| Error::SchemaError(format!("Null in metrics column {name}"))))
        .collect()
}

fn metrics_from_batch(batch: &RecordBatch) -> Result<Vec<DerivedMetric>> {
    let text = |name: &str| -> Result<Vec<Option<String>>> {
        storage::string_values(batch, column(batch, name)?)
    };
    let run_ids = required(text("run_id")?, "run_id")?;
    let groups = required(text("chip_group")?, "chip_group")?;
    let numbers = required(storage::i64_values(batch, column(batch, "chip_number")?)?, "chip_number")?;
    let procedures = required(text("procedure")?, "procedure")?;
    let seq_nums = required(storage::i64_values(batch, column(batch, "seq_num")?)?, "seq_num")?;
    let names = required(text("metric_name")?, "metric_name")?;
    let categories = required(text("metric_category")?, "metric_category")?;
    let floats = storage::f64_values(batch, column(batch, "value_float")?)?;
    let strs = text("value_str")?;
    let jsons = text("value_json")?;
    let units = text("unit")?;
    let methods = required(text("extraction_method")?, "extraction_method")?;
    let versions = required(text("extraction_version")?, "extraction_version")?;
    let stamps = required(
        storage::timestamp_values(batch, column(batch, "extraction_timestamp")?)?,
        "extraction_timestamp",
    )?;
    let confidences = required(
        storage::f64_values(batch, column(batch, "confidence")?)?,
        "confidence",
    )?;
    let flags = text("flags")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let value = match (floats[row], &strs[row], &jsons[row]) {
            (Some(v), _, _) => MetricValue::Float(v),
            (None, Some(s), _) => MetricValue::Text(s.clone()),
            (None, None, Some(j)) => MetricValue::Json(serde_json::from_str(j)?),
            (None, None, None) => {
                return Err(Error::SchemaError(format!(
                    "Metric {} of run {} has no value",
                    names[row], run_ids[row]
                )))
            }
        };
        let seq_num = u64::try_from(seq_nums[row])
            .map_err(|_| Error::SchemaError(format!("Negative seq_num {}", seq_nums[row])))?;

        let mut builder = DerivedMetricBuilder::new(
            run_ids[row].clone(),
            ChipId::new(groups[row].clone(), numbers[row]),
            procedures[row].clone(),
            seq_num,
            names[row].clone(),
            value,
        )
        .category(categories[row].clone())
        .method(methods[row].clone())
        .version(versions[row].clone())
        .timestamp(stamps[row])
        .confidence(confidences[row]);
        if let Some(unit) = &units[row] {
            builder = builder.unit(unit.clone());
        }
        if let Some(flag) = flags[row].as_deref().filter(|f| !f.is_empty()) {
            builder = builder.flag(flag);
        }
        out.push(builder.build());
    }
    Ok(out)
}
