//! Upsert kernel: applies a keyed source batch to a target batch.
//!
//! Matched target rows are replaced by the full source row in place; source
//! rows with no match are appended in source order. Key columns must be
//! integer typed; keys are compared as `i64`.

use std::collections::HashMap;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::{cast, interleave};
use arrow::datatypes::{DataType, Int64Type};
use arrow::record_batch::RecordBatch;

use crate::error::{Result, StoreError};
use crate::schema::from_arrow_schema;

/// Key validation failure on a merge source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key column '{key}' is missing")]
    MissingColumn { key: String },

    #[error("key column '{key}' has type {data_type}, expected an integer")]
    NotInteger { key: String, data_type: String },

    #[error("key column '{key}' is null at row {row}")]
    NullKey { key: String, row: usize },

    #[error("key column '{key}' contains {value} more than once (rows {first_row} and {row})")]
    DuplicateKey {
        key: String,
        value: i64,
        first_row: usize,
        row: usize,
    },
}

fn key_column(batch: &RecordBatch, key: &str) -> std::result::Result<ArrayRef, KeyError> {
    let idx = batch
        .schema()
        .index_of(key)
        .map_err(|_| KeyError::MissingColumn {
            key: key.to_string(),
        })?;
    let column = batch.column(idx);
    let not_integer = || KeyError::NotInteger {
        key: key.to_string(),
        data_type: column.data_type().to_string(),
    };
    match column.data_type() {
        DataType::Int64 => Ok(column.clone()),
        DataType::Int32 => cast(column, &DataType::Int64).map_err(|_| not_integer()),
        _ => Err(not_integer()),
    }
}

/// Read the key column of `batch`, allowing nulls.
///
/// # Errors
///
/// Returns [`KeyError`] if the column is missing or not integer typed.
pub fn optional_keys(batch: &RecordBatch, key: &str) -> std::result::Result<Vec<Option<i64>>, KeyError> {
    let column = key_column(batch, key)?;
    Ok(column.as_primitive::<Int64Type>().iter().collect())
}

/// Validate a merge source's keys: present, integer, non-null, and unique.
///
/// Returns a map from key value to source row index.
///
/// # Errors
///
/// Returns the first [`KeyError`] found, scanning rows in order.
pub fn unique_keys(batch: &RecordBatch, key: &str) -> std::result::Result<HashMap<i64, usize>, KeyError> {
    let column = key_column(batch, key)?;
    let keys = column.as_primitive::<Int64Type>();
    let mut index = HashMap::with_capacity(keys.len());
    for (row, value) in keys.iter().enumerate() {
        let Some(value) = value else {
            return Err(KeyError::NullKey {
                key: key.to_string(),
                row,
            });
        };
        if let Some(first_row) = index.insert(value, row) {
            return Err(KeyError::DuplicateKey {
                key: key.to_string(),
                value,
                first_row,
                row,
            });
        }
    }
    Ok(index)
}

/// Result of applying a source batch to a target batch.
#[derive(Debug, Clone)]
pub struct UpsertOutput {
    pub batch: RecordBatch,
    pub inserted: u64,
    pub updated: u64,
}

/// Upsert `source` into `target` keyed on `key`.
///
/// Every target row whose key equals a source key is replaced by that source
/// row; target rows with a null key never match. The output uses the
/// target's schema.
///
/// # Errors
///
/// Returns [`StoreError::SchemaMismatch`] if the column names or types
/// differ, [`StoreError::InvalidSource`] if the source keys are invalid, and
/// [`StoreError::Arrow`] if the output cannot be assembled (for example a
/// null written into a non-nullable column).
pub fn apply_upsert(target: &RecordBatch, source: &RecordBatch, key: &str) -> Result<UpsertOutput> {
    let target_schema = from_arrow_schema(&target.schema()).map_err(|detail| {
        StoreError::SchemaMismatch {
            target: "merge target".to_string(),
            detail,
        }
    })?;
    let source_schema = from_arrow_schema(&source.schema()).map_err(|detail| {
        StoreError::SchemaMismatch {
            target: "merge source".to_string(),
            detail,
        }
    })?;
    if let Some(detail) = target_schema.mismatch(&source_schema) {
        return Err(StoreError::SchemaMismatch {
            target: "merge source".to_string(),
            detail,
        });
    }

    let source_index = unique_keys(source, key)?;
    let target_keys = optional_keys(target, key)?;

    // (0, row) selects from target, (1, row) from source.
    let mut indices: Vec<(usize, usize)> =
        Vec::with_capacity(target.num_rows() + source.num_rows());
    let mut matched = vec![false; source.num_rows()];
    let mut updated = 0u64;
    for (row, value) in target_keys.iter().enumerate() {
        match value.and_then(|v| source_index.get(&v)) {
            Some(&source_row) => {
                matched[source_row] = true;
                indices.push((1, source_row));
                updated += 1;
            }
            None => indices.push((0, row)),
        }
    }
    let mut inserted = 0u64;
    for (source_row, was_matched) in matched.iter().enumerate() {
        if !was_matched {
            indices.push((1, source_row));
            inserted += 1;
        }
    }

    let columns = (0..target.num_columns())
        .map(|i| {
            let pair: [&dyn Array; 2] = [target.column(i).as_ref(), source.column(i).as_ref()];
            interleave(&pair, &indices)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let batch = RecordBatch::try_new(target.schema(), columns)?;

    Ok(UpsertOutput {
        batch,
        inserted,
        updated,
    })
}
