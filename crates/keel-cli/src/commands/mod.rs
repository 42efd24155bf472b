pub mod check;
pub mod history;
pub mod run;
pub mod show;

use std::path::Path;

use anyhow::{Context, Result};
use keel_engine::config::parser;
use keel_engine::config::types::PipelineConfig;
use keel_store::SqliteTableStore;

pub(crate) fn load_config(pipeline_path: &Path) -> Result<PipelineConfig> {
    parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))
}

/// Open the catalog of an existing pipeline, refusing to create a new one.
pub(crate) fn open_existing(config: &PipelineConfig) -> Result<SqliteTableStore> {
    let layout = config.storage.layout();
    if !layout.catalog_path.exists() {
        anyhow::bail!(
            "No catalog at {}; run the pipeline first",
            layout.catalog_path.display()
        );
    }
    let path = layout.catalog_path.clone();
    SqliteTableStore::open(layout)
        .with_context(|| format!("Failed to open catalog: {}", path.display()))
}
