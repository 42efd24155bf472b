//! Conversion between [`TableSchema`] and Arrow schemas.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use keel_types::schema::{ColumnSchema, ColumnType, TableSchema};

/// Map a logical column type to its Arrow data type.
#[must_use]
pub fn column_type_to_arrow(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Int32 => DataType::Int32,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::TimestampSeconds => DataType::Timestamp(TimeUnit::Second, None),
        ColumnType::TimestampMicros => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

/// Map an Arrow data type back to a logical column type.
///
/// Returns `None` for Arrow types a table cannot store. The mapping is
/// exact: only types that [`column_type_to_arrow`] produces are accepted.
#[must_use]
pub fn arrow_to_column_type(dt: &DataType) -> Option<ColumnType> {
    match dt {
        DataType::Boolean => Some(ColumnType::Boolean),
        DataType::Int32 => Some(ColumnType::Int32),
        DataType::Int64 => Some(ColumnType::Int64),
        DataType::Float64 => Some(ColumnType::Float64),
        DataType::Utf8 => Some(ColumnType::Utf8),
        DataType::Timestamp(TimeUnit::Second, None) => Some(ColumnType::TimestampSeconds),
        DataType::Timestamp(TimeUnit::Microsecond, None) => Some(ColumnType::TimestampMicros),
        _ => None,
    }
}

/// Build the Arrow schema for a table schema.
#[must_use]
pub fn to_arrow_schema(schema: &TableSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|col| Field::new(&col.name, column_type_to_arrow(col.data_type), col.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Describe an Arrow schema as a table schema.
///
/// # Errors
///
/// Returns `Err` naming the first field whose Arrow type is unsupported.
pub fn from_arrow_schema(schema: &Schema) -> Result<TableSchema, String> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            arrow_to_column_type(field.data_type())
                .map(|ty| ColumnSchema::new(field.name(), ty, field.is_nullable()))
                .ok_or_else(|| {
                    format!(
                        "column '{}' has unsupported type {}",
                        field.name(),
                        field.data_type()
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TableSchema::new(columns))
}
