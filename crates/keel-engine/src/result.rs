//! Pipeline execution result types.

use keel_types::ident::{SnapshotId, StagedLocation, TableIdent};
use keel_types::merge::MergeResult;
use keel_types::schema::TableSchema;

/// Result of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: i64,
    pub table: TableIdent,
    pub staged_at: StagedLocation,
    pub rows_staged: u64,
    /// The run created the table from its input batch.
    pub table_created: bool,
    /// `None` when the table was just created from this batch and there was
    /// nothing left to merge.
    pub merge: Option<MergeResult>,
    /// Table snapshot current after the run.
    pub snapshot_id: Option<SnapshotId>,
    pub duration_secs: f64,
}

impl PipelineOutcome {
    #[must_use]
    pub fn rows_inserted(&self) -> u64 {
        match &self.merge {
            Some(merge) => merge.inserted,
            None if self.table_created => self.rows_staged,
            None => 0,
        }
    }

    #[must_use]
    pub fn rows_updated(&self) -> u64 {
        self.merge.map_or(0, |m| m.updated)
    }

    /// Commit attempts spent by the merge; zero when it was skipped.
    #[must_use]
    pub fn merge_attempts(&self) -> u32 {
        self.merge.map_or(0, |m| m.attempts)
    }
}

/// Result of a pre-flight pipeline check.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub config_ok: bool,
    pub catalog_ok: bool,
    pub table_exists: bool,
    pub input_rows: Option<usize>,
    pub input_schema: Option<TableSchema>,
    /// Human-readable problems, one per entry.
    pub issues: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}
