//! Column and table schema descriptions.
//!
//! Maps the column types an ingestion table supports onto a portable subset of
//! Arrow logical types. The store converts these to Arrow schemas; the catalog
//! persists them as JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "int")]
    Int32,
    #[serde(alias = "bigint", alias = "long")]
    Int64,
    #[serde(alias = "double", alias = "float")]
    Float64,
    #[serde(alias = "string", alias = "text")]
    Utf8,
    #[serde(alias = "timestamp")]
    TimestampSeconds,
    TimestampMicros,
}

impl ColumnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::TimestampSeconds => "timestamp_seconds",
            Self::TimestampMicros => "timestamp_micros",
        }
    }

    /// Whether values of this type can serve as a merge key.
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    /// Whether a column inferred as `self` can be loaded into a column
    /// declared as `declared`.
    #[must_use]
    pub fn loads_into(self, declared: ColumnType) -> bool {
        if self == declared {
            return true;
        }
        match declared {
            Self::Utf8 => true,
            // Text inference reports every integer as 64-bit; range is
            // checked when the values are decoded.
            Self::Int32 | Self::Int64 => self.is_integer(),
            Self::Float64 => self.is_integer(),
            Self::TimestampSeconds | Self::TimestampMicros => {
                self.is_integer() || self == Self::Utf8
            }
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered list of columns describing a table or batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

impl TableSchema {
    #[must_use]
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// First column name that appears more than once, if any.
    #[must_use]
    pub fn duplicate_column(&self) -> Option<&str> {
        self.columns.iter().enumerate().find_map(|(i, col)| {
            self.columns[..i]
                .iter()
                .any(|prev| prev.name == col.name)
                .then_some(col.name.as_str())
        })
    }

    /// Describe how `other` differs from `self` by column name and type.
    ///
    /// Nullability is ignored: a batch that happens to contain no nulls may
    /// be declared non-nullable while the table column is nullable.
    /// Returns `None` when both schemas have the same columns in the same
    /// order with the same types.
    #[must_use]
    pub fn mismatch(&self, other: &TableSchema) -> Option<String> {
        if self.columns.len() != other.columns.len() {
            return Some(format!(
                "expected {} columns, found {}",
                self.columns.len(),
                other.columns.len()
            ));
        }
        for (expected, actual) in self.columns.iter().zip(&other.columns) {
            if expected.name != actual.name {
                return Some(format!(
                    "expected column '{}', found '{}'",
                    expected.name, actual.name
                ));
            }
            if expected.data_type != actual.data_type {
                return Some(format!(
                    "column '{}' expected {}, found {}",
                    expected.name, expected.data_type, actual.data_type
                ));
            }
        }
        None
    }
}
