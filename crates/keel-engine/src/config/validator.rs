//! Semantic validation for parsed pipeline configuration values.

use anyhow::{bail, Result};
use keel_types::ident::validate_identifier;

use crate::config::types::PipelineConfig;

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if let Err(e) = validate_identifier("namespace", &config.target.namespace) {
        errors.push(e.to_string());
    }
    if let Err(e) = validate_identifier("table", &config.target.table) {
        errors.push(e.to_string());
    }
    if let Some(location) = &config.target.staging_location {
        if let Err(e) = validate_identifier("staging location", location) {
            errors.push(e.to_string());
        }
    }

    let key = config.target.merge_key.as_str();
    if key.trim().is_empty() {
        errors.push("Target merge_key must not be empty".to_string());
    }

    if let Some(schema) = &config.schema {
        if schema.is_empty() {
            errors.push("Declared schema must list at least one column".to_string());
        }
        if let Some(name) = schema.duplicate_column() {
            errors.push(format!("Declared schema lists column '{name}' more than once"));
        }
        match schema.column(key) {
            None if !key.trim().is_empty() => errors.push(format!(
                "Merge key '{key}' is not a column of the declared schema"
            )),
            Some(column) if !column.data_type.is_integer() => errors.push(format!(
                "Merge key '{key}' must be an integer column, declared {}",
                column.data_type
            )),
            _ => {}
        }
    }

    if config.source.path.as_os_str().is_empty() {
        errors.push("Source path must not be empty".to_string());
    }

    if config.merge.max_retries == 0 {
        errors.push("merge.max_retries must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
