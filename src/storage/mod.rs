//! Storage backend (Arrow/Parquet)
//!
//! **Append-Only Inputs**:
//! - The manifest and the staged measurement partitions are written upstream and
//!   are only ever read here
//! - Derived outputs (metrics store, enriched histories) are rewritten whole,
//!   through a temp file and a rename, so readers never observe a torn file
//!
//! A partition path is either a single Parquet file or a directory of
//! `*.parquet` parts, read in lexicographic order.

mod columns;
mod measurement;

pub use columns::{
    bool_values, f64_values, find_column, i64_values, normalize_column_name, string_values,
    timestamp_values,
};
pub use measurement::MeasurementData;

use crate::{Error, Result};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// In-memory table of Arrow record batches sharing one schema
#[derive(Debug, Clone, Default)]
pub struct StorageEngine {
    batches: Vec<RecordBatch>,
    /// File schema, kept so zero-row files still describe their columns
    file_schema: Option<SchemaRef>,
}

impl StorageEngine {
    /// Create a new storage engine from existing batches
    ///
    /// Useful for testing and for handing freshly built batches to the writer
    #[must_use]
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches,
            file_schema: None,
        }
    }

    /// Load table from Parquet file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            Error::StorageError(format!(
                "Failed to open Parquet file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            Error::StorageError(format!("Failed to parse Parquet file: {e}"))
        })?;
        let file_schema = builder.schema().clone();

        let reader = builder.build().map_err(|e| {
            Error::StorageError(format!("Failed to create Parquet reader: {e}"))
        })?;

        // Read all batches into memory
        let mut batches = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| {
                Error::StorageError(format!("Failed to read record batch: {e}"))
            })?;
            batches.push(batch);
        }

        Ok(Self {
            batches,
            file_schema: Some(file_schema),
        })
    }

    /// Load a partition: a Parquet file, or every `*.parquet` file in a directory
    ///
    /// # Errors
    /// Returns error if the path does not exist, holds no Parquet parts, or a part
    /// fails to parse
    pub fn load_partition<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            return Self::load_parquet(path);
        }
        if !path.is_dir() {
            return Err(Error::StorageError(format!(
                "Partition not found: {}",
                path.display()
            )));
        }

        let mut parts: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        parts.sort();

        if parts.is_empty() {
            return Err(Error::StorageError(format!(
                "No Parquet parts under {}",
                path.display()
            )));
        }

        let mut storage = Self::default();
        for part in parts {
            let part = Self::load_parquet(&part)?;
            if storage.file_schema.is_none() {
                storage.file_schema = part.file_schema;
            }
            for batch in part.batches {
                storage.append_batch(batch)?;
            }
        }
        Ok(storage)
    }

    /// Get all record batches
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total row count across batches
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Schema of the first batch, else the schema of the file it was loaded from
    #[must_use]
    pub fn schema(&self) -> Option<SchemaRef> {
        self.batches
            .first()
            .map(RecordBatch::schema)
            .or_else(|| self.file_schema.clone())
    }

    /// Append batches to storage
    ///
    /// # Errors
    ///
    /// Returns error if batch schema doesn't match existing batches
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        // Validate schema compatibility
        if let Some(existing_schema) = self.batches.first().map(RecordBatch::schema) {
            if batch.schema() != existing_schema {
                return Err(Error::StorageError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    existing_schema,
                    batch.schema()
                )));
            }
        }

        self.batches.push(batch);
        Ok(())
    }

    /// Concatenate every batch into one
    ///
    /// A zero-row file yields an empty batch with the file's schema.
    ///
    /// # Errors
    /// Returns error if the table has no schema at all or concatenation fails
    pub fn concat(&self) -> Result<RecordBatch> {
        let schema = self
            .schema()
            .ok_or_else(|| Error::StorageError("Table holds no record batches".to_string()))?;
        if self.batches.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }
        Ok(arrow::compute::concat_batches(&schema, &self.batches)?)
    }

    /// Write the table to `path` as a single snappy-compressed Parquet file
    ///
    /// Data lands in a sibling temp file first and is renamed into place.
    ///
    /// # Errors
    /// Returns error if the table is empty or the file cannot be written
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let schema = self
            .schema()
            .ok_or_else(|| Error::StorageError("Refusing to write an empty table".to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = temp_sibling(path);
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();

        let write = || -> Result<()> {
            let file = File::create(&tmp_path)?;
            let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
            for batch in &self.batches {
                writer.write(batch)?;
            }
            writer.close()?;
            Ok(())
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_precision_loss)]
    fn create_test_batch(num_rows: usize) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("value", DataType::Float64, false),
            Field::new("name", DataType::Utf8, false),
        ]);

        let id_array = Int32Array::from_iter_values(0..num_rows as i32);
        let value_array = Float64Array::from_iter_values((0..num_rows).map(|i| i as f64));
        let name_array = StringArray::from_iter_values((0..num_rows).map(|i| format!("name_{i}")));

        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(id_array),
                Arc::new(value_array),
                Arc::new(name_array),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_append_batch_schema_validation() {
        let mut storage = StorageEngine::new(vec![]);
        storage.append_batch(create_test_batch(10)).unwrap();

        let incompatible_schema = Schema::new(vec![Field::new(
            "different_field",
            DataType::Int32,
            false,
        )]);
        let incompatible_batch = RecordBatch::try_new(
            Arc::new(incompatible_schema),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();

        let result = storage.append_batch(incompatible_batch);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Schema mismatch"));
    }

    #[test]
    fn test_write_then_load_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("table.parquet");

        let storage = StorageEngine::new(vec![create_test_batch(100), create_test_batch(50)]);
        storage.write_parquet(&path).unwrap();

        let loaded = StorageEngine::load_parquet(&path).unwrap();
        assert_eq!(loaded.num_rows(), 150);
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn test_load_partition_directory_reads_all_parts() {
        let dir = tempfile::tempdir().unwrap();
        StorageEngine::new(vec![create_test_batch(3)])
            .write_parquet(dir.path().join("part-0.parquet"))
            .unwrap();
        StorageEngine::new(vec![create_test_batch(4)])
            .write_parquet(dir.path().join("part-1.parquet"))
            .unwrap();
        fs::write(dir.path().join("README.txt"), "not parquet").unwrap();

        let loaded = StorageEngine::load_partition(dir.path()).unwrap();
        assert_eq!(loaded.num_rows(), 7);
        assert_eq!(loaded.concat().unwrap().num_rows(), 7);
    }

    #[test]
    fn test_load_partition_missing_path() {
        let err = StorageEngine::load_partition("/definitely/not/here").unwrap_err();
        assert!(err.to_string().contains("Partition not found"));
    }

    #[test]
    fn test_zero_row_file_keeps_its_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        let empty = RecordBatch::new_empty(create_test_batch(1).schema());
        StorageEngine::new(vec![empty]).write_parquet(&path).unwrap();

        let loaded = StorageEngine::load_partition(&path).unwrap();
        assert_eq!(loaded.num_rows(), 0);
        let batch = loaded.concat().unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 3);
        assert!(batch.schema().field_with_name("name").is_ok());
    }

    #[test]
    fn test_write_empty_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = StorageEngine::default().write_parquet(dir.path().join("x.parquet"));
        assert!(result.is_err());
    }
}
