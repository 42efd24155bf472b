use std::path::Path;

use anyhow::Result;
use keel_engine::check_pipeline;

fn status(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAILED"
    }
}

/// Execute the `check` command: validate config, catalog, and input.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_config(pipeline_path)?;
    let report = check_pipeline(&config).await?;

    println!("{:18} {}", "Configuration:", status(report.config_ok));
    println!("{:18} {}", "Catalog:", status(report.catalog_ok));
    println!(
        "{:18} {}",
        "Target table:",
        if report.table_exists {
            "exists"
        } else {
            "will be created"
        }
    );
    match (report.input_rows, &report.input_schema) {
        (Some(rows), Some(schema)) => {
            println!("{:18} {rows} rows, {} columns", "Input:", schema.len());
            for column in schema.columns() {
                let null = if column.nullable { "" } else { " not null" };
                println!("  {} {}{null}", column.name, column.data_type);
            }
        }
        _ => println!("{:18} FAILED", "Input:"),
    }

    if report.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        for issue in &report.issues {
            println!("  - {issue}");
        }
        anyhow::bail!("One or more checks failed")
    }
}
