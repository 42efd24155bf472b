use std::path::Path;

use anyhow::{Context, Result};
use keel_store::TableStore;

/// Execute the `history` command: list snapshots and recent runs.
pub fn execute(pipeline_path: &Path, limit: usize) -> Result<()> {
    let config = super::load_config(pipeline_path)?;
    let store = super::open_existing(&config)?;
    let table = config.target.ident();

    if store.table_exists(&table)? {
        let snapshots = store
            .snapshots(&table)
            .with_context(|| format!("Failed to list snapshots of {table}"))?;
        println!("Snapshots of {table}:");
        println!(
            "  {:>8}  {:>8}  {:<8}  {:>10}  {:>10}  {:>10}  committed",
            "id", "parent", "op", "rows", "inserted", "updated"
        );
        for s in &snapshots {
            let parent = s.parent_id.map_or_else(|| "-".to_string(), |p| p.to_string());
            println!(
                "  {:>8}  {:>8}  {:<8}  {:>10}  {:>10}  {:>10}  {}",
                s.id.get(),
                parent,
                s.operation.as_str(),
                s.row_count,
                s.rows_inserted,
                s.rows_updated,
                s.committed_at
            );
        }
    } else {
        println!("Table {table} does not exist yet.");
    }

    let runs = store.runs(&config.pipeline_id(), limit)?;
    println!("\nRecent runs of '{}':", config.pipeline);
    if runs.is_empty() {
        println!("  (none)");
    }
    for run in &runs {
        println!(
            "  #{:<6} {:<10} started {}  staged {} inserted {} updated {}",
            run.run_id,
            run.status.as_str(),
            run.started_at,
            run.stats.rows_staged,
            run.stats.rows_inserted,
            run.stats.rows_updated
        );
        if let Some(message) = &run.stats.error_message {
            println!("          {message}");
        }
    }
    Ok(())
}
