//! Pipeline configuration types deserialized from YAML.

use std::path::{Path, PathBuf};

use keel_store::StorageLayout;
use keel_types::ident::{PipelineId, StagedLocation, TableIdent};
use keel_types::schema::TableSchema;
use serde::{Deserialize, Serialize};

use crate::batch::InputFormat;
use crate::merge::RetryPolicy;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub storage: StorageConfig,
    pub target: TargetConfig,
    /// Declared table schema; inferred from the input when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
    pub source: SourceConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

impl PipelineConfig {
    #[must_use]
    pub fn pipeline_id(&self) -> PipelineId {
        PipelineId::new(self.pipeline.clone())
    }
}

/// Where staging files, table data, and the catalog live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub warehouse_path: PathBuf,
    /// Defaults to `<warehouse_path>/catalog.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,
}

impl StorageConfig {
    #[must_use]
    pub fn layout(&self) -> StorageLayout {
        let layout = StorageLayout::new(&self.base_path, &self.warehouse_path);
        match &self.catalog_path {
            Some(path) => layout.with_catalog_path(path),
            None => layout,
        }
    }
}

/// Target table and merge key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub namespace: String,
    pub table: String,
    pub merge_key: String,
    /// Defaults to the table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_location: Option<String>,
}

impl TargetConfig {
    #[must_use]
    pub fn ident(&self) -> TableIdent {
        TableIdent::new(self.namespace.as_str(), self.table.as_str())
    }

    #[must_use]
    pub fn staging_location(&self) -> StagedLocation {
        StagedLocation::new(
            self.staging_location
                .clone()
                .unwrap_or_else(|| self.table.clone()),
        )
    }
}

/// Input file to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Guessed from the file extension when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<InputFormat>,
}

impl SourceConfig {
    #[must_use]
    pub fn format(&self) -> InputFormat {
        self.format
            .unwrap_or_else(|| InputFormat::from_path(Path::new(&self.path)))
    }
}

/// Merge retry settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl MergeConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }
}
