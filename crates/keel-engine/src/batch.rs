//! Input batches: loading JSON Lines / CSV files into Arrow and checking
//! them against declared table schemas.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use keel_store::schema::{from_arrow_schema, to_arrow_schema};
use keel_types::schema::{ColumnType, TableSchema};
use serde::{Deserialize, Serialize};

/// Failure while building a [`Batch`].
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to open input '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode input: {0}")]
    Decode(#[from] ArrowError),

    #[error("{0}")]
    Inference(String),
}

/// Input file encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// One JSON object per line.
    #[default]
    #[serde(alias = "json", alias = "ndjson")]
    Jsonl,
    /// Comma-separated values with a header row.
    Csv,
}

impl InputFormat {
    /// Guess the format from a file extension; anything but `.csv` is JSON Lines.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::Jsonl,
        }
    }
}

/// An ordered set of rows sharing one table schema.
#[derive(Debug, Clone)]
pub struct Batch {
    rows: RecordBatch,
    schema: TableSchema,
}

impl Batch {
    /// Wrap `rows`, describing them by their own Arrow schema.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Inference`] if a column's type can't be stored.
    pub fn try_new(rows: RecordBatch) -> Result<Self, BatchError> {
        let schema = from_arrow_schema(&rows.schema()).map_err(BatchError::Inference)?;
        Ok(Self { rows, schema })
    }

    /// Wrap `rows` under a declared schema, which supplies nullability.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Inference`] if the rows' column names or types
    /// differ from `declared`.
    pub fn with_declared(rows: RecordBatch, declared: &TableSchema) -> Result<Self, BatchError> {
        let actual = from_arrow_schema(&rows.schema()).map_err(BatchError::Inference)?;
        if let Some(detail) = declared.mismatch(&actual) {
            return Err(BatchError::Inference(detail));
        }
        Ok(Self {
            rows,
            schema: declared.clone(),
        })
    }

    #[must_use]
    pub fn rows(&self) -> &RecordBatch {
        &self.rows
    }

    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.num_rows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.num_rows() == 0
    }
}

fn open(path: &Path) -> Result<File, BatchError> {
    File::open(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn infer_arrow_schema(path: &Path, format: InputFormat) -> Result<Schema, BatchError> {
    let file = open(path)?;
    let (schema, _) = match format {
        InputFormat::Jsonl => arrow::json::reader::infer_json_schema(BufReader::new(file), None)?,
        InputFormat::Csv => arrow::csv::reader::Format::default()
            .with_header(true)
            .infer_schema(file, None)?,
    };
    Ok(schema)
}

/// Infer a table schema from the contents of `path`.
///
/// Only usable at bootstrap time; a declared schema always wins.
///
/// # Errors
///
/// Returns [`BatchError::Inference`] if the file has no columns or a column
/// has a type a table can't store.
pub fn infer_schema(path: &Path, format: InputFormat) -> Result<TableSchema, BatchError> {
    let schema = infer_arrow_schema(path, format)?;
    table_schema_of(path, &schema)
}

fn table_schema_of(path: &Path, schema: &Schema) -> Result<TableSchema, BatchError> {
    if schema.fields().is_empty() {
        return Err(BatchError::Inference(format!(
            "no columns found in '{}'",
            path.display()
        )));
    }
    from_arrow_schema(schema).map_err(BatchError::Inference)
}

/// Check that every inferred column is declared with a type it loads into.
///
/// # Errors
///
/// Returns [`BatchError::Inference`] naming every incompatible column.
pub fn validate_inferred(declared: &TableSchema, inferred: &TableSchema) -> Result<(), BatchError> {
    let mut errors = Vec::new();
    for column in inferred.columns() {
        match declared.column(&column.name) {
            None => errors.push(format!("column '{}' is not declared", column.name)),
            Some(target) if !column.data_type.loads_into(target.data_type) => {
                errors.push(format!(
                    "column '{}' looks like {} but is declared {}",
                    column.name, column.data_type, target.data_type
                ));
            }
            Some(_) => {}
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BatchError::Inference(errors.join("; ")))
    }
}

/// Declared schema with every column nullable, so null keys reach merge
/// validation instead of failing inside the decoder.
fn relaxed(declared: &TableSchema) -> SchemaRef {
    let strict = to_arrow_schema(declared);
    let fields: Vec<Field> = strict
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn decode(path: &Path, format: InputFormat, schema: SchemaRef) -> Result<RecordBatch, BatchError> {
    let file = open(path)?;
    let batches = match format {
        InputFormat::Jsonl => arrow::json::ReaderBuilder::new(schema.clone())
            .build(BufReader::new(file))?
            .collect::<Result<Vec<_>, _>>()?,
        InputFormat::Csv => arrow::csv::ReaderBuilder::new(schema.clone())
            .with_header(true)
            .build(file)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(concat_batches(&schema, &batches)?)
}

/// Decode `path` against `declared`.
///
/// Timestamp columns whose values look like integers are epoch counts in
/// the column's unit; they are decoded as `Int64` and cast, since the CSV
/// timestamp parser only accepts formatted dates.
fn decode_declared(
    path: &Path,
    format: InputFormat,
    declared: &TableSchema,
    inferred: Option<&TableSchema>,
) -> Result<RecordBatch, BatchError> {
    let target = relaxed(declared);
    let epoch: Vec<bool> = declared
        .columns()
        .iter()
        .map(|column| {
            matches!(
                column.data_type,
                ColumnType::TimestampSeconds | ColumnType::TimestampMicros
            ) && inferred
                .and_then(|schema| schema.column(&column.name))
                .is_some_and(|found| found.data_type.is_integer())
        })
        .collect();
    if !epoch.contains(&true) {
        return decode(path, format, target);
    }

    let raw_fields: Vec<Field> = target
        .fields()
        .iter()
        .zip(&epoch)
        .map(|(field, &is_epoch)| {
            let field = field.as_ref().clone();
            if is_epoch {
                field.with_data_type(DataType::Int64)
            } else {
                field
            }
        })
        .collect();
    let raw = decode(path, format, Arc::new(Schema::new(raw_fields)))?;
    let columns = raw
        .columns()
        .iter()
        .zip(target.fields())
        .zip(&epoch)
        .map(|((column, field), &is_epoch)| {
            if is_epoch {
                cast(column, field.data_type())
            } else {
                Ok(column.clone())
            }
        })
        .collect::<Result<Vec<ArrayRef>, _>>()?;
    Ok(RecordBatch::try_new(target, columns)?)
}

/// Load `path` into a single batch.
///
/// With a declared schema the file is decoded against it, after checking
/// that what the file appears to contain is compatible. Without one the
/// schema comes from [`infer_schema`] and an empty file is an error.
///
/// # Errors
///
/// Returns [`BatchError::Io`] if the file can't be read,
/// [`BatchError::Decode`] if a value doesn't parse as its column type, and
/// [`BatchError::Inference`] for schema problems.
pub fn read_batch(
    path: &Path,
    format: InputFormat,
    declared: Option<&TableSchema>,
) -> Result<Batch, BatchError> {
    let Some(declared) = declared else {
        let schema = infer_schema(path, format)?;
        let rows = decode(path, format, to_arrow_schema(&schema))?;
        if rows.num_rows() == 0 {
            return Err(BatchError::Inference(format!(
                "no records in '{}' to infer a schema from",
                path.display()
            )));
        }
        return Batch::try_new(rows);
    };

    let inferred = infer_arrow_schema(path, format)?;
    let inferred = if inferred.fields().is_empty() {
        None
    } else {
        Some(from_arrow_schema(&inferred).map_err(BatchError::Inference)?)
    };

    if let Some(inferred) = &inferred {
        validate_inferred(declared, inferred)?;
        if format == InputFormat::Csv {
            // CSV columns bind by position.
            let header: Vec<&str> = inferred.columns().iter().map(|c| c.name.as_str()).collect();
            let expected: Vec<&str> = declared.columns().iter().map(|c| c.name.as_str()).collect();
            if header != expected {
                return Err(BatchError::Inference(format!(
                    "csv header [{}] does not match declared columns [{}]",
                    header.join(", "),
                    expected.join(", ")
                )));
            }
        }
    }

    let rows = decode_declared(path, format, declared, inferred.as_ref())?;
    Batch::with_declared(rows, declared)
}
