//! Identifier newtypes for namespaces, tables, staging locations, and snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error returned when a name cannot be used as a catalog identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} identifier '{value}': {reason}")]
pub struct IdentError {
    pub kind: &'static str,
    pub value: String,
    pub reason: &'static str,
}

/// Check that `value` is usable as a catalog identifier.
///
/// Identifiers end up as directory and file names in the warehouse, so only
/// ASCII letters, digits, `_` and `-` are accepted and the first character
/// must be a letter or `_`.
///
/// # Errors
///
/// Returns [`IdentError`] describing the first violated rule.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), IdentError> {
    let fail = |reason| {
        Err(IdentError {
            kind,
            value: value.to_string(),
            reason,
        })
    };
    let Some(first) = value.chars().next() else {
        return fail("must not be empty");
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return fail("must start with a letter or '_'");
    }
    if value.len() > 128 {
        return fail("must be at most 128 characters");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return fail("may only contain letters, digits, '_' and '-'");
    }
    Ok(())
}

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a name without validating it.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Validate the wrapped name as a catalog identifier.
            ///
            /// # Errors
            ///
            /// Returns [`IdentError`] if the name is not a valid identifier.
            pub fn validate(&self) -> Result<(), IdentError> {
                validate_identifier($kind, &self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<&String> for $name {
            fn from(value: &String) -> Self {
                Self(value.clone())
            }
        }
    };
}

string_newtype!(
    /// Logical namespace (database) that groups tables in the catalog.
    Namespace,
    "namespace"
);

string_newtype!(
    /// Table name, unique within a namespace.
    TableName,
    "table"
);

string_newtype!(
    /// Opaque name of a durable staging location the merger can read from.
    StagedLocation,
    "staging location"
);

string_newtype!(
    /// Pipeline name used to group run history.
    PipelineId,
    "pipeline"
);

/// Fully qualified `(namespace, table)` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdent {
    pub namespace: Namespace,
    pub name: TableName,
}

impl TableIdent {
    #[must_use]
    pub fn new(namespace: impl Into<Namespace>, name: impl Into<TableName>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Validate both parts of the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IdentError`] for the first invalid part.
    pub fn validate(&self) -> Result<(), IdentError> {
        self.namespace.validate()?;
        self.name.validate()
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Monotonic snapshot identifier assigned by the catalog on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(i64);

impl SnapshotId {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
