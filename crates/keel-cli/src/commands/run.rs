use std::path::Path;

use anyhow::Result;
use keel_engine::config::validator;
use keel_engine::run_pipeline;

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path, json: bool) -> Result<()> {
    let config = super::load_config(pipeline_path)?;
    validator::validate_pipeline(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        table = %config.target.ident(),
        source = %config.source.path.display(),
        "Pipeline validated"
    );

    let outcome = run_pipeline(&config).await?;

    if json {
        let value = serde_json::json!({
            "pipeline": config.pipeline,
            "run_id": outcome.run_id,
            "table": outcome.table.to_string(),
            "staged_at": outcome.staged_at.to_string(),
            "table_created": outcome.table_created,
            "rows_staged": outcome.rows_staged,
            "rows_inserted": outcome.rows_inserted(),
            "rows_updated": outcome.rows_updated(),
            "merge_attempts": outcome.merge_attempts(),
            "snapshot_id": outcome.snapshot_id.map(|s| s.get()),
            "duration_secs": outcome.duration_secs,
        });
        println!("{value}");
        return Ok(());
    }

    println!("Pipeline '{}' completed successfully.", config.pipeline);
    println!("  Table:           {}", outcome.table);
    println!("  Staged at:       {}", outcome.staged_at);
    println!("  Rows staged:     {}", outcome.rows_staged);
    if outcome.table_created {
        println!("  Table created:   yes ({} rows)", outcome.rows_inserted());
    } else {
        println!("  Rows inserted:   {}", outcome.rows_inserted());
        println!("  Rows updated:    {}", outcome.rows_updated());
        if outcome.merge_attempts() > 1 {
            println!("  Merge attempts:  {}", outcome.merge_attempts());
        }
    }
    if let Some(snapshot) = outcome.snapshot_id {
        println!("  Snapshot:        {snapshot}");
    }
    println!("  Duration:        {:.2}s", outcome.duration_secs);

    Ok(())
}
