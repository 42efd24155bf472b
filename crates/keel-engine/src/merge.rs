//! Merger: validated, atomic upsert of a staged batch into a table, retried
//! on optimistic-concurrency conflicts.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use keel_store::schema::from_arrow_schema;
use keel_store::upsert::{unique_keys, KeyError};
use keel_store::{StoreError, TableStore};
use keel_types::ident::{StagedLocation, TableIdent};
use keel_types::merge::{MergeOp, MergeResult};
use keel_types::schema::TableSchema;

use crate::blocking::run_blocking;
use crate::bootstrap::TableHandle;
use crate::errors::{compute_backoff, PipelineError};

/// How often and how patiently a conflicting merge is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 100,
        }
    }
}

fn key_error(
    table: &TableIdent,
    location: &StagedLocation,
    key: &str,
    err: KeyError,
) -> PipelineError {
    match err {
        KeyError::DuplicateKey { value, .. } => PipelineError::DuplicateKeyInBatch {
            table: table.clone(),
            location: location.clone(),
            key: key.to_string(),
            key_value: value,
        },
        other => PipelineError::InvalidMergeKey {
            table: table.clone(),
            location: location.clone(),
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Check a merge source before anything is written.
///
/// The key must be an integer column of the table, present, non-null and
/// unique in `source`, and `source` must have the table's columns.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidMergeKey`],
/// [`PipelineError::DuplicateKeyInBatch`], or
/// [`PipelineError::SchemaMismatch`] for the first problem found.
pub fn validate_source(
    table: &TableIdent,
    table_schema: &TableSchema,
    location: &StagedLocation,
    key: &str,
    source: &RecordBatch,
) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidMergeKey {
        table: table.clone(),
        location: location.clone(),
        key: key.to_string(),
        reason,
    };
    match table_schema.column(key) {
        None => return Err(invalid("not a column of the table".to_string())),
        Some(column) if !column.data_type.is_integer() => {
            return Err(invalid(format!(
                "table column has type {}, expected an integer",
                column.data_type
            )));
        }
        Some(_) => {}
    }

    unique_keys(source, key).map_err(|e| key_error(table, location, key, e))?;

    let mismatch = |detail| PipelineError::SchemaMismatch {
        table: table.clone(),
        detail,
    };
    let source_schema = from_arrow_schema(&source.schema()).map_err(mismatch)?;
    match table_schema.mismatch(&source_schema) {
        Some(detail) => Err(mismatch(detail)),
        None => Ok(()),
    }
}

/// Upsert the batch staged at `location` into the handle's table by `key`.
///
/// Matched rows are replaced in full and unmatched rows are appended; the
/// whole change becomes visible as one new snapshot or not at all. Commit
/// conflicts with concurrent writers are retried with exponential backoff
/// up to `policy.max_retries` times.
///
/// # Errors
///
/// Validation failures (see [`validate_source`]) are reported before any
/// write. Exhausted retries yield [`PipelineError::MergeConflict`].
pub async fn merge(
    store: &Arc<dyn TableStore>,
    handle: &TableHandle,
    location: &StagedLocation,
    key: &str,
    policy: &RetryPolicy,
) -> Result<MergeResult, PipelineError> {
    let table = handle.ident();

    let staged = location.clone();
    let source = run_blocking(store, "read_staging", move |s| s.read_staging(&staged))
        .await?
        .map_err(PipelineError::Store)?;
    validate_source(table, handle.schema(), location, key, &source)?;

    let op = MergeOp::upsert(table.clone(), location.clone(), key);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let op_for_task = op.clone();
        let result = run_blocking(store, "transactional_merge", move |s| {
            s.transactional_merge(&op_for_task)
        })
        .await?;

        match result {
            Ok(commit) => {
                tracing::info!(
                    table = %table,
                    source = %location,
                    snapshot = %commit.snapshot_id,
                    inserted = commit.inserted,
                    updated = commit.updated,
                    attempt,
                    "Merge committed"
                );
                return Ok(MergeResult {
                    attempts: attempt,
                    ..MergeResult::from(commit)
                });
            }
            Err(ref err) if err.is_conflict() && attempt <= policy.max_retries => {
                let delay = compute_backoff(policy.backoff_base_ms, attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                tracing::warn!(
                    table = %table,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms,
                    error = %err,
                    "Merge commit conflict, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_conflict() => {
                tracing::error!(
                    table = %table,
                    attempt,
                    max_retries = policy.max_retries,
                    "Max retries exhausted, failing merge"
                );
                return Err(PipelineError::MergeConflict {
                    table: table.clone(),
                    attempts: attempt,
                });
            }
            Err(StoreError::InvalidSource(e)) => return Err(key_error(table, location, key, e)),
            Err(StoreError::SchemaMismatch { detail, .. }) => {
                return Err(PipelineError::SchemaMismatch {
                    table: table.clone(),
                    detail,
                })
            }
            Err(err) => return Err(PipelineError::Store(err)),
        }
    }
}
