//! Pipeline orchestrator: loads the input, stages it, bootstraps the target
//! table, merges, and records the run.

use std::sync::Arc;
use std::time::Instant;

use keel_store::{SqliteTableStore, TableStore};
use keel_types::ident::{SnapshotId, TableIdent};
use keel_types::run::{RunStats, RunStatus};

use crate::batch::{read_batch, Batch, BatchError};
use crate::blocking::run_blocking;
use crate::bootstrap::ensure_table;
use crate::config::types::PipelineConfig;
use crate::config::validator::validate_pipeline;
use crate::errors::PipelineError;
use crate::merge::{merge, validate_source};
use crate::result::{CheckReport, PipelineOutcome};
use crate::stage::stage;

fn task_panicked(operation: &str, e: &tokio::task::JoinError) -> PipelineError {
    PipelineError::Infrastructure(anyhow::anyhow!("{operation} task panicked: {e}"))
}

/// Open the `SQLite` table store described by the config.
///
/// # Errors
///
/// Returns [`PipelineError::CatalogUnavailable`] if the catalog can't be
/// opened or initialized.
pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn TableStore>, PipelineError> {
    let layout = config.storage.layout();
    let table = config.target.ident();
    let store = tokio::task::spawn_blocking(move || SqliteTableStore::open(layout))
        .await
        .map_err(|e| task_panicked("open_store", &e))?
        .map_err(|e| PipelineError::from_catalog(&table, e))?;
    Ok(Arc::new(store))
}

/// Run a full pipeline against the store named in the config.
///
/// # Errors
///
/// Returns the first [`PipelineError`] raised by any stage; the run is
/// recorded as failed with that error's message.
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineOutcome, PipelineError> {
    let store = open_store(config).await?;
    run_pipeline_with_store(config, store).await
}

/// Run a full pipeline against an already opened store.
///
/// # Errors
///
/// Returns [`PipelineError::Infrastructure`] for an invalid config without
/// recording a run; otherwise see [`run_pipeline`].
pub async fn run_pipeline_with_store(
    config: &PipelineConfig,
    store: Arc<dyn TableStore>,
) -> Result<PipelineOutcome, PipelineError> {
    validate_pipeline(config)?;
    let start = Instant::now();
    let table = config.target.ident();
    let pipeline_id = config.pipeline_id();
    tracing::info!(
        pipeline = config.pipeline,
        table = %table,
        "Starting pipeline run"
    );

    let (pipeline_for_run, table_for_run) = (pipeline_id.clone(), table.clone());
    let run_id = run_blocking(&store, "start_run", move |s| {
        s.start_run(&pipeline_for_run, &table_for_run)
    })
    .await?
    .map_err(|e| PipelineError::from_catalog(&table, e))?;

    let result = execute_stages(config, &store, &table, run_id, start).await;

    let (status, stats) = match &result {
        Ok(outcome) => (
            RunStatus::Completed,
            RunStats {
                rows_staged: outcome.rows_staged,
                rows_inserted: outcome.rows_inserted(),
                rows_updated: outcome.rows_updated(),
                snapshot_id: outcome.snapshot_id.map(SnapshotId::get),
                error_message: None,
            },
        ),
        Err(err) => (
            RunStatus::Failed,
            RunStats {
                error_message: Some(format!("{}: {err}", err.kind())),
                ..RunStats::default()
            },
        ),
    };
    let recorded = run_blocking(&store, "complete_run", move |s| {
        s.complete_run(run_id, status, &stats)
    })
    .await;

    match result {
        Ok(outcome) => {
            recorded?.map_err(|e| PipelineError::from_catalog(&table, e))?;
            tracing::info!(
                pipeline = config.pipeline,
                table = %table,
                run_id,
                rows_staged = outcome.rows_staged,
                inserted = outcome.rows_inserted(),
                updated = outcome.rows_updated(),
                snapshot = ?outcome.snapshot_id,
                duration_secs = outcome.duration_secs,
                "Pipeline run completed"
            );
            Ok(outcome)
        }
        Err(err) => {
            if let Err(e) = recorded.and_then(|r| r.map_err(PipelineError::Store)) {
                tracing::warn!(run_id, error = %e, "Failed to record failed run");
            }
            tracing::error!(
                pipeline = config.pipeline,
                table = %table,
                run_id,
                kind = err.kind(),
                retryable = err.is_retryable(),
                "Pipeline run failed: {err}"
            );
            Err(err)
        }
    }
}

async fn execute_stages(
    config: &PipelineConfig,
    store: &Arc<dyn TableStore>,
    table: &TableIdent,
    run_id: i64,
    start: Instant,
) -> Result<PipelineOutcome, PipelineError> {
    let batch = load_input(config, table).await?;
    let location = config.target.staging_location();
    let key = config.target.merge_key.as_str();

    // Key problems abort the run before anything is written, bootstrap included.
    validate_source(table, batch.schema(), &location, key, batch.rows())?;

    let staged_at = stage(store, &location, &batch).await?;
    let handle = ensure_table(store, table, &batch).await?;

    let merged = if handle.created {
        tracing::info!(table = %table, "Table bootstrapped from this batch, merge skipped");
        None
    } else {
        Some(merge(store, &handle, &staged_at, key, &config.merge.policy()).await?)
    };

    let snapshot_id = merged
        .and_then(|m| m.snapshot_id)
        .or(handle.metadata.current_snapshot);
    Ok(PipelineOutcome {
        run_id,
        table: table.clone(),
        staged_at,
        rows_staged: batch.num_rows() as u64,
        table_created: handle.created,
        merge: merged,
        snapshot_id,
        duration_secs: start.elapsed().as_secs_f64(),
    })
}

async fn load_input(config: &PipelineConfig, table: &TableIdent) -> Result<Batch, PipelineError> {
    let path = config.source.path.clone();
    let format = config.source.format();
    let declared = config.schema.clone();
    let loaded = tokio::task::spawn_blocking(move || read_batch(&path, format, declared.as_ref()))
        .await
        .map_err(|e| task_panicked("load_input", &e))?;

    let batch = loaded.map_err(|err| match err {
        BatchError::Io { .. } => PipelineError::Infrastructure(anyhow::Error::new(err)),
        BatchError::Decode(_) | BatchError::Inference(_) => PipelineError::SchemaInference {
            table: table.clone(),
            reason: err.to_string(),
        },
    })?;
    tracing::info!(
        source = %config.source.path.display(),
        format = ?format,
        rows = batch.num_rows(),
        columns = batch.schema().len(),
        "Input loaded"
    );
    Ok(batch)
}

/// Record a check failure, propagating only infrastructure errors.
fn note(report: &mut CheckReport, err: PipelineError) -> Result<(), PipelineError> {
    match err {
        PipelineError::Infrastructure(_) => Err(err),
        other => {
            report.issues.push(other.to_string());
            Ok(())
        }
    }
}

/// Validate configuration, catalog reachability, and input readability
/// without writing table data.
///
/// # Errors
///
/// Returns an error only if a background task fails; every other problem is
/// reported in [`CheckReport::issues`].
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckReport, PipelineError> {
    tracing::info!(
        pipeline = config.pipeline,
        "Checking pipeline configuration"
    );
    let mut report = CheckReport::default();

    match validate_pipeline(config) {
        Ok(()) => report.config_ok = true,
        Err(e) => report.issues.push(e.to_string()),
    }

    let table = config.target.ident();
    let mut table_schema = None;
    if config.storage.layout().catalog_path.exists() {
        match open_store(config).await {
            Ok(store) => {
                report.catalog_ok = true;
                let lookup = table.clone();
                match run_blocking(&store, "load_table", move |s| {
                    if s.table_exists(&lookup)? {
                        s.load_table(&lookup).map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .await?
                {
                    Ok(Some(metadata)) => {
                        report.table_exists = true;
                        table_schema = Some(metadata.schema);
                    }
                    Ok(None) => {}
                    Err(e) => note(&mut report, PipelineError::from_catalog(&table, e))?,
                }
            }
            Err(e) => note(&mut report, e)?,
        }
    } else {
        // Created on first run.
        report.catalog_ok = true;
    }

    match load_input(config, &table).await {
        Ok(batch) => {
            report.input_rows = Some(batch.num_rows());
            if batch.is_empty() {
                report.issues.push("Input contains no rows".to_string());
            }
            let schema = table_schema.as_ref().unwrap_or(batch.schema());
            if let Err(e) = validate_source(
                &table,
                schema,
                &config.target.staging_location(),
                &config.target.merge_key,
                batch.rows(),
            ) {
                note(&mut report, e)?;
            }
            report.input_schema = Some(batch.schema().clone());
        }
        Err(PipelineError::Infrastructure(e)) => report.issues.push(format!("{e:#}")),
        Err(e) => note(&mut report, e)?,
    }

    Ok(report)
}
