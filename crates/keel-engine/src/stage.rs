//! Stager: durable, overwrite-in-place writes of incoming batches.

use std::sync::Arc;

use keel_store::TableStore;
use keel_types::ident::StagedLocation;
use keel_types::merge::WriteMode;

use crate::batch::Batch;
use crate::blocking::run_blocking;
use crate::errors::PipelineError;

/// Write `batch` to `location`, replacing whatever was staged there.
///
/// Re-staging a location never accumulates rows, so retrying a failed call
/// is safe.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyBatch`] before writing anything if `batch`
/// has no rows, and [`PipelineError::StageWrite`] if the store fails.
pub async fn stage(
    store: &Arc<dyn TableStore>,
    location: &StagedLocation,
    batch: &Batch,
) -> Result<StagedLocation, PipelineError> {
    if batch.is_empty() {
        return Err(PipelineError::EmptyBatch {
            location: location.clone(),
        });
    }

    let target = location.clone();
    let rows = batch.rows().clone();
    let receipt = run_blocking(store, "write_staging", move |s| {
        s.write_staging(&target, &rows, WriteMode::Overwrite)
    })
    .await?
    .map_err(|source| PipelineError::StageWrite {
        location: location.clone(),
        source,
    })?;

    tracing::info!(
        location = %receipt.location,
        rows = receipt.row_count,
        bytes = receipt.bytes_written,
        path = %receipt.path.display(),
        "Batch staged"
    );
    Ok(receipt.location)
}
