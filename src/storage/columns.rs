//! Typed column readers with tolerant name lookup
//!
//! Upstream tables are not uniform about column naming (`VL (V)`, `vl_v`,
//! `laser_voltage_v`) or physical types (timestamps as Arrow timestamps, RFC 3339
//! strings, or epoch microseconds). Readers cast to one canonical type.

use crate::{Error, Result};
use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Lowercase a column name and strip everything but ASCII alphanumerics.
///
/// `"VL (V)"` and `"vl_v"` both normalize to `"vlv"`.
#[must_use]
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Find the first column matching any candidate name.
///
/// Exact matches win over normalized matches; candidates are tried in order.
#[must_use]
pub fn find_column(schema: &Schema, candidates: &[&str]) -> Option<usize> {
    for candidate in candidates {
        if let Ok(idx) = schema.index_of(candidate) {
            return Some(idx);
        }
    }
    let normalized: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| normalize_column_name(f.name()))
        .collect();
    for candidate in candidates {
        let wanted = normalize_column_name(candidate);
        if let Some(idx) = normalized.iter().position(|n| *n == wanted) {
            return Some(idx);
        }
    }
    None
}

fn cast_column(batch: &RecordBatch, idx: usize, to: &DataType) -> Result<Arc<dyn Array>> {
    let column = batch.column(idx);
    cast(column, to).map_err(|e| {
        Error::SchemaError(format!(
            "Column '{}' ({}) cannot be read as {to}: {e}",
            batch.schema().field(idx).name(),
            column.data_type()
        ))
    })
}

/// Read a column as strings.
///
/// # Errors
/// Returns error if the column cannot be cast to `Utf8`
pub fn string_values(batch: &RecordBatch, idx: usize) -> Result<Vec<Option<String>>> {
    let array = cast_column(batch, idx, &DataType::Utf8)?;
    let array = array
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::SchemaError("Utf8 cast produced unexpected array".to_string()))?;
    Ok(array.iter().map(|v| v.map(str::to_string)).collect())
}

/// Read a column as `f64`.
///
/// # Errors
/// Returns error if the column cannot be cast to `Float64`
pub fn f64_values(batch: &RecordBatch, idx: usize) -> Result<Vec<Option<f64>>> {
    let array = cast_column(batch, idx, &DataType::Float64)?;
    let array = array
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| Error::SchemaError("Float64 cast produced unexpected array".to_string()))?;
    Ok(array.iter().collect())
}

/// Read a column as `i64`.
///
/// # Errors
/// Returns error if the column cannot be cast to `Int64`
pub fn i64_values(batch: &RecordBatch, idx: usize) -> Result<Vec<Option<i64>>> {
    let array = cast_column(batch, idx, &DataType::Int64)?;
    let array = array
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| Error::SchemaError("Int64 cast produced unexpected array".to_string()))?;
    Ok(array.iter().collect())
}

/// Read a column as booleans.
///
/// # Errors
/// Returns error if the column cannot be cast to `Boolean`
pub fn bool_values(batch: &RecordBatch, idx: usize) -> Result<Vec<Option<bool>>> {
    let array = cast_column(batch, idx, &DataType::Boolean)?;
    let array = array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| Error::SchemaError("Boolean cast produced unexpected array".to_string()))?;
    Ok(array.iter().collect())
}

/// Read a column as UTC timestamps.
///
/// Integer columns are taken as epoch microseconds. Naive timestamps and
/// strings without an offset are taken as UTC.
///
/// # Errors
/// Returns error if the column cannot be interpreted as a timestamp
pub fn timestamp_values(batch: &RecordBatch, idx: usize) -> Result<Vec<Option<DateTime<Utc>>>> {
    let column = batch.column(idx);
    let micros: Vec<Option<i64>> = match column.data_type() {
        DataType::Int64 | DataType::Int32 | DataType::UInt64 => i64_values(batch, idx)?,
        _ => {
            // Offset form parses without a timezone database
            let target = DataType::Timestamp(TimeUnit::Microsecond, Some("+00:00".into()));
            let array = cast_column(batch, idx, &target)?;
            let array = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(|| {
                    Error::SchemaError("Timestamp cast produced unexpected array".to_string())
                })?;
            (0..array.len())
                .map(|i| (!array.is_null(i)).then(|| array.value(i)))
                .collect()
        }
    };
    Ok(micros
        .into_iter()
        .map(|m| m.and_then(DateTime::from_timestamp_micros))
        .collect())
}
