//! Pipeline error model and retry backoff policy helpers.

use std::time::Duration;

use keel_store::StoreError;
use keel_types::ident::{Namespace, StagedLocation, TableIdent};

const BACKOFF_MAX_MS: u64 = 60_000;

/// Categorized pipeline failure.
///
/// Every variant that concerns a table or staged batch carries enough
/// context (table, location, key value) for a caller to retry safely: a
/// stage is an idempotent overwrite and a merge commits atomically.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("catalog unavailable for namespace '{namespace}': {source}")]
    CatalogUnavailable {
        namespace: Namespace,
        #[source]
        source: StoreError,
    },

    #[error("cannot infer schema for '{table}': {reason}")]
    SchemaInference { table: TableIdent, reason: String },

    #[error("failed to write staging location '{location}': {source}")]
    StageWrite {
        location: StagedLocation,
        #[source]
        source: StoreError,
    },

    #[error("invalid merge key '{key}' in '{location}' for '{table}': {reason}")]
    InvalidMergeKey {
        table: TableIdent,
        location: StagedLocation,
        key: String,
        reason: String,
    },

    #[error("merge into '{table}' still conflicting after {attempts} attempt(s)")]
    MergeConflict { table: TableIdent, attempts: u32 },

    #[error("staged batch '{location}' for '{table}' contains {key}={key_value} more than once")]
    DuplicateKeyInBatch {
        table: TableIdent,
        location: StagedLocation,
        key: String,
        key_value: i64,
    },

    #[error("refusing to stage an empty batch at '{location}'")]
    EmptyBatch { location: StagedLocation },

    #[error("schema mismatch for '{table}': {detail}")]
    SchemaMismatch { table: TableIdent, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    /// Returns `true` when re-running the whole pipeline is safe and may
    /// succeed: catalog outages, staging write failures, and exhausted
    /// merge conflicts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CatalogUnavailable { .. } | Self::StageWrite { .. } | Self::MergeConflict { .. }
        )
    }

    /// Stable name of the error category, used in run history and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable { .. } => "catalog_unavailable",
            Self::SchemaInference { .. } => "schema_inference",
            Self::StageWrite { .. } => "stage_write",
            Self::InvalidMergeKey { .. } => "invalid_merge_key",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::DuplicateKeyInBatch { .. } => "duplicate_key_in_batch",
            Self::EmptyBatch { .. } => "empty_batch",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::Store(_) => "store",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Map a store failure during a catalog operation.
    ///
    /// Failures reaching the catalog itself become `CatalogUnavailable`;
    /// anything else keeps its store classification.
    pub(crate) fn from_catalog(table: &TableIdent, err: StoreError) -> Self {
        match err {
            StoreError::Sqlite(_)
            | StoreError::SqliteContext { .. }
            | StoreError::LockPoisoned
            | StoreError::Io(_)
            | StoreError::NamespaceNotFound(_) => Self::CatalogUnavailable {
                namespace: table.namespace.clone(),
                source: err,
            },
            StoreError::SchemaMismatch { detail, .. } => Self::SchemaMismatch {
                table: table.clone(),
                detail,
            },
            other => Self::Store(other),
        }
    }
}

/// Compute the delay before retry `attempt` (1-based).
///
/// Doubles from `base_ms` per attempt, capped at 60 seconds.
pub(crate) fn compute_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}
