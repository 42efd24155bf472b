//! Typed merge (upsert) and staging write requests.

use serde::{Deserialize, Serialize};

use crate::ident::{SnapshotId, StagedLocation, TableIdent};

/// How a staging write treats existing contents at the location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace whatever is at the location.
    #[default]
    Overwrite,
    /// Concatenate with existing rows; schemas must match.
    Append,
}

/// Action applied to a target row whose key matches a source row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedAction {
    /// Replace every column of the target row with the source row.
    #[default]
    ReplaceAll,
}

/// Action applied to a source row with no matching target row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotMatchedAction {
    /// Append the full source row.
    #[default]
    InsertAll,
}

/// A single upsert transaction: `target.key = source.key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOp {
    pub target: TableIdent,
    pub source: StagedLocation,
    pub key: String,
    #[serde(default)]
    pub on_match: MatchedAction,
    #[serde(default)]
    pub on_no_match: NotMatchedAction,
}

impl MergeOp {
    /// Upsert keyed on `key` with full-row replace and insert-all.
    #[must_use]
    pub fn upsert(target: TableIdent, source: StagedLocation, key: impl Into<String>) -> Self {
        Self {
            target,
            source,
            key: key.into(),
            on_match: MatchedAction::ReplaceAll,
            on_no_match: NotMatchedAction::InsertAll,
        }
    }
}

/// Outcome of a committed merge as reported by the table store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCommit {
    pub snapshot_id: SnapshotId,
    pub parent_id: Option<SnapshotId>,
    pub inserted: u64,
    pub updated: u64,
}

/// Merge statistics returned to pipeline callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub inserted: u64,
    pub updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
    /// Number of commit attempts, including the successful one.
    pub attempts: u32,
}

impl MergeResult {
    #[must_use]
    pub fn total_affected(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl From<MergeCommit> for MergeResult {
    fn from(commit: MergeCommit) -> Self {
        Self {
            inserted: commit.inserted,
            updated: commit.updated,
            snapshot_id: Some(commit.snapshot_id),
            attempts: 1,
        }
    }
}
