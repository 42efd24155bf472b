//! Table bootstrap: create the target table from an initial batch exactly once.

use std::sync::Arc;

use keel_store::{StoreError, TableMetadata, TableStore};
use keel_types::ident::TableIdent;
use keel_types::schema::TableSchema;

use crate::batch::Batch;
use crate::blocking::run_blocking;
use crate::errors::PipelineError;

/// Handle to a table known to exist in the catalog.
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub metadata: TableMetadata,
    /// Whether this call created the table (loading the initial batch).
    pub created: bool,
}

impl TableHandle {
    #[must_use]
    pub fn ident(&self) -> &TableIdent {
        &self.metadata.ident
    }

    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.metadata.schema
    }
}

/// Ensure `table` exists, creating it from `initial` if absent.
///
/// An existing table is returned as-is and `initial` is not loaded, so
/// repeated calls never duplicate rows. A writer that loses a creation race
/// gets the winner's table.
///
/// # Errors
///
/// - [`PipelineError::CatalogUnavailable`] if the catalog can't be queried.
/// - [`PipelineError::SchemaInference`] if the table is absent and `initial`
///   has no rows to define it from.
/// - [`PipelineError::SchemaMismatch`] if the table exists with columns that
///   differ from `initial`'s.
pub async fn ensure_table(
    store: &Arc<dyn TableStore>,
    table: &TableIdent,
    initial: &Batch,
) -> Result<TableHandle, PipelineError> {
    table.validate().map_err(StoreError::from)?;

    let lookup = table.clone();
    let exists = run_blocking(store, "table_exists", move |s| s.table_exists(&lookup))
        .await?
        .map_err(|e| PipelineError::from_catalog(table, e))?;

    if exists {
        let handle = load_existing(store, table).await?;
        check_schema(&handle, initial)?;
        tracing::info!(table = %table, "Table already present, initial batch not loaded");
        return Ok(handle);
    }

    if initial.is_empty() {
        return Err(PipelineError::SchemaInference {
            table: table.clone(),
            reason: "initial batch is empty".to_string(),
        });
    }

    let namespace = table.namespace.clone();
    run_blocking(store, "create_namespace", move |s| s.create_namespace(&namespace))
        .await?
        .map_err(|e| PipelineError::from_catalog(table, e))?;

    let target = table.clone();
    let schema = initial.schema().clone();
    let rows = initial.rows().clone();
    let created = run_blocking(store, "create_table", move |s| {
        s.create_table(&target, &schema, &rows)
    })
    .await?;

    match created {
        Ok(metadata) => {
            tracing::info!(
                table = %table,
                rows = initial.num_rows(),
                snapshot = ?metadata.current_snapshot,
                "Table created from initial batch"
            );
            Ok(TableHandle {
                metadata,
                created: true,
            })
        }
        Err(StoreError::TableAlreadyExists(_)) => {
            tracing::info!(table = %table, "Table created concurrently, using existing table");
            let handle = load_existing(store, table).await?;
            check_schema(&handle, initial)?;
            Ok(handle)
        }
        Err(e) => Err(PipelineError::from_catalog(table, e)),
    }
}

async fn load_existing(
    store: &Arc<dyn TableStore>,
    table: &TableIdent,
) -> Result<TableHandle, PipelineError> {
    let lookup = table.clone();
    let metadata = run_blocking(store, "load_table", move |s| s.load_table(&lookup))
        .await?
        .map_err(|e| PipelineError::from_catalog(table, e))?;
    Ok(TableHandle {
        metadata,
        created: false,
    })
}

fn check_schema(handle: &TableHandle, initial: &Batch) -> Result<(), PipelineError> {
    match handle.schema().mismatch(initial.schema()) {
        Some(detail) => Err(PipelineError::SchemaMismatch {
            table: handle.ident().clone(),
            detail,
        }),
        None => Ok(()),
    }
}
