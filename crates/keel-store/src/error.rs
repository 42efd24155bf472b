//! Table store error types.

use keel_types::ident::{IdentError, Namespace, SnapshotId, StagedLocation, TableIdent};

use crate::upsert::KeyError;

/// Errors produced by [`TableStore`](crate::TableStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` catalog failure.
    #[error("catalog error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Catalog failure annotated with the operation that hit it.
    #[error("catalog error during {operation}: {source}")]
    SqliteContext {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure on a data or staging file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow encode/decode or compute failure.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Catalog metadata could not be (de)serialized.
    #[error("metadata codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("table store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    InvalidIdentifier(#[from] IdentError),

    #[error("namespace '{0}' does not exist")]
    NamespaceNotFound(Namespace),

    #[error("table '{0}' does not exist")]
    TableNotFound(TableIdent),

    #[error("table '{0}' already exists")]
    TableAlreadyExists(TableIdent),

    #[error("staging location '{0}' has not been written")]
    StagingNotFound(StagedLocation),

    #[error("snapshot {snapshot} not found for table '{table}'")]
    SnapshotNotFound {
        table: TableIdent,
        snapshot: SnapshotId,
    },

    /// Rows do not match the schema they are being written against.
    #[error("schema mismatch for {target}: {detail}")]
    SchemaMismatch { target: String, detail: String },

    /// Merge source failed key validation.
    #[error("invalid merge source: {0}")]
    InvalidSource(#[from] KeyError),

    /// A catalog row holds a value no reader of this catalog recognizes.
    #[error("corrupt catalog: {column} holds unrecognized value '{value}'")]
    CorruptCatalog { column: &'static str, value: String },

    /// A concurrent writer committed a snapshot after this one was based.
    #[error(
        "commit conflict on '{table}': expected current snapshot {}, found {}",
        fmt_snapshot(.expected),
        fmt_snapshot(.actual)
    )]
    CommitConflict {
        table: TableIdent,
        expected: Option<SnapshotId>,
        actual: Option<SnapshotId>,
    },
}

fn fmt_snapshot(id: &Option<SnapshotId>) -> String {
    id.map_or_else(|| "none".to_string(), |id| id.to_string())
}

impl StoreError {
    pub(crate) fn context(operation: &'static str, source: rusqlite::Error) -> Self {
        Self::SqliteContext { operation, source }
    }

    /// Whether the error is an optimistic-concurrency conflict that can be
    /// resolved by re-running the operation against the new snapshot.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::CommitConflict { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
