use std::path::Path;

use anyhow::{Context, Result};
use arrow::util::pretty::pretty_format_batches;
use keel_store::TableStore;
use keel_types::ident::SnapshotId;

/// Execute the `show` command: print the target table's rows.
pub fn execute(pipeline_path: &Path, snapshot: Option<i64>, limit: usize) -> Result<()> {
    let config = super::load_config(pipeline_path)?;
    let store = super::open_existing(&config)?;
    let table = config.target.ident();

    let rows = match snapshot {
        Some(id) => store.read_snapshot(&table, SnapshotId::new(id)),
        None => store.read_table(&table),
    }
    .with_context(|| format!("Failed to read table {table}"))?;

    let shown = rows.slice(0, rows.num_rows().min(limit));
    println!("{}", pretty_format_batches(&[shown])?);
    if rows.num_rows() > limit {
        println!("({} of {} rows shown)", limit, rows.num_rows());
    } else {
        println!("({} rows)", rows.num_rows());
    }
    Ok(())
}
