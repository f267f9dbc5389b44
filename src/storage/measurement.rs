//! Columnar data of one staged measurement

use super::{columns, StorageEngine};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use std::path::Path;

/// Columnar samples of a single measurement, loaded from its partition.
///
/// Extractors read signal columns by name through [`MeasurementData::column_f64`],
/// which accepts a list of aliases and matches them tolerantly.
#[derive(Debug, Clone)]
pub struct MeasurementData {
    batch: RecordBatch,
}

impl MeasurementData {
    /// Wrap an in-memory batch.
    #[must_use]
    pub const fn from_batch(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Load a measurement partition (file or directory of parts).
    ///
    /// # Errors
    /// Returns error if the partition is missing, holds no Parquet parts, or is unreadable
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = StorageEngine::load_partition(path)?;
        Ok(Self {
            batch: storage.concat()?,
        })
    }

    /// Underlying record batch.
    #[must_use]
    pub const fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Number of samples.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Whether any alias resolves to a column.
    #[must_use]
    pub fn has_column(&self, aliases: &[&str]) -> bool {
        columns::find_column(&self.batch.schema(), aliases).is_some()
    }

    /// Read a numeric column; nulls become `NaN`.
    ///
    /// # Errors
    /// Returns [`Error::SchemaError`] if no alias matches or the column is not numeric
    pub fn column_f64(&self, aliases: &[&str]) -> Result<Vec<f64>> {
        let idx = columns::find_column(&self.batch.schema(), aliases).ok_or_else(|| {
            Error::SchemaError(format!("None of the columns {aliases:?} present"))
        })?;
        Ok(columns::f64_values(&self.batch, idx)?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }

    /// Like [`column_f64`](Self::column_f64) but `None` when the column is absent.
    ///
    /// # Errors
    /// Returns error if the column exists but is not numeric
    pub fn column_f64_opt(&self, aliases: &[&str]) -> Result<Option<Vec<f64>>> {
        if self.has_column(aliases) {
            self.column_f64(aliases).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn sweep() -> MeasurementData {
        let schema = Schema::new(vec![
            Field::new("Vg (V)", DataType::Float64, false),
            Field::new("I (A)", DataType::Float64, true),
            Field::new("step", DataType::Int64, false),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Float64Array::from(vec![-1.0, 0.0, 1.0])),
                Arc::new(Float64Array::from(vec![Some(1e-6), None, Some(3e-6)])),
                Arc::new(Int64Array::from(vec![0, 1, 2])),
            ],
        )
        .unwrap();
        MeasurementData::from_batch(batch)
    }

    #[test]
    fn test_column_lookup_by_alias() {
        let data = sweep();
        assert_eq!(data.num_rows(), 3);
        assert_eq!(data.column_f64(&["vg", "Vg (V)"]).unwrap(), vec![-1.0, 0.0, 1.0]);
        assert_eq!(data.column_f64(&["vg_v"]).unwrap().len(), 3);
    }

    #[test]
    fn test_nulls_become_nan() {
        let current = sweep().column_f64(&["I (A)"]).unwrap();
        assert!(current[1].is_nan());
    }

    #[test]
    fn test_missing_column() {
        let data = sweep();
        assert!(matches!(
            data.column_f64(&["power"]),
            Err(Error::SchemaError(_))
        ));
        assert!(data.column_f64_opt(&["power"]).unwrap().is_none());
        assert!(data.column_f64_opt(&["step"]).unwrap().is_some());
    }
}
