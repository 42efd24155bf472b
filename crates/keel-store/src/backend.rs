//! Table store trait definition.
//!
//! [`TableStore`] is the storage contract the ingestion pipeline issues
//! catalog, staging, and merge requests against. Identifier and request
//! types live in [`keel_types`].

use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use keel_types::ident::{Namespace, PipelineId, SnapshotId, StagedLocation, TableIdent, TableName};
use keel_types::merge::{MergeCommit, MergeOp, WriteMode};
use keel_types::run::{RunRecord, RunStats, RunStatus};
use keel_types::schema::TableSchema;
use serde::{Deserialize, Serialize};

use crate::error;

/// Catalog entry for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub ident: TableIdent,
    pub schema: TableSchema,
    /// Snapshot readers currently see. `None` only for tables created
    /// outside [`TableStore::create_table`].
    pub current_snapshot: Option<SnapshotId>,
    /// ISO-8601 UTC creation time.
    pub created_at: String,
}

/// Operation that produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOperation {
    Create,
    Merge,
}

impl SnapshotOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Merge => "merge",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

/// One entry of a table's snapshot log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub parent_id: Option<SnapshotId>,
    pub operation: SnapshotOperation,
    /// Data file path relative to the warehouse root.
    pub data_file: String,
    pub row_count: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    /// ISO-8601 UTC commit time.
    pub committed_at: String,
}

/// Acknowledgement of a durable staging write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingReceipt {
    pub location: StagedLocation,
    pub path: PathBuf,
    /// Rows at the location after the write.
    pub row_count: u64,
    pub bytes_written: u64,
}

/// Storage contract for catalog-managed tables.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn TableStore>`.
/// Every mutating operation is atomic: readers observe either the state
/// before it or the state after it.
pub trait TableStore: Send + Sync {
    /// Whether `namespace` is registered in the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn namespace_exists(&self, namespace: &Namespace) -> error::Result<bool>;

    /// Register `namespace`. Succeeds without change if it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure
    /// or an invalid identifier.
    fn create_namespace(&self, namespace: &Namespace) -> error::Result<()>;

    /// Whether `table` is registered in the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn table_exists(&self, table: &TableIdent) -> error::Result<bool>;

    /// Names of the tables registered in `namespace`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn list_tables(&self, namespace: &Namespace) -> error::Result<Vec<TableName>>;

    /// Load the catalog entry for `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableNotFound`](crate::error::StoreError::TableNotFound)
    /// if the table is not registered.
    fn load_table(&self, table: &TableIdent) -> error::Result<TableMetadata>;

    /// Create `table` with `schema` and commit `initial_rows` as its first
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TableAlreadyExists`](crate::error::StoreError::TableAlreadyExists)
    /// if another writer registered the table first,
    /// [`StoreError::NamespaceNotFound`](crate::error::StoreError::NamespaceNotFound)
    /// if the namespace is missing, and
    /// [`StoreError::SchemaMismatch`](crate::error::StoreError::SchemaMismatch)
    /// if the rows do not match `schema`.
    fn create_table(
        &self,
        table: &TableIdent,
        schema: &TableSchema,
        initial_rows: &RecordBatch,
    ) -> error::Result<TableMetadata>;

    /// Durably write `rows` to a staging location.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on I/O failure, or a
    /// schema mismatch when appending to rows of a different shape.
    fn write_staging(
        &self,
        location: &StagedLocation,
        rows: &RecordBatch,
        mode: WriteMode,
    ) -> error::Result<StagingReceipt>;

    /// Read everything currently at a staging location.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StagingNotFound`](crate::error::StoreError::StagingNotFound)
    /// if nothing has been staged there.
    fn read_staging(&self, location: &StagedLocation) -> error::Result<RecordBatch>;

    /// Apply `op` as a single snapshot commit.
    ///
    /// Performs one optimistic attempt: the commit succeeds only if the
    /// table's current snapshot is still the one the merge was computed
    /// against.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CommitConflict`](crate::error::StoreError::CommitConflict)
    /// if another snapshot was committed concurrently; the table is left
    /// unchanged by this call in every error case.
    fn transactional_merge(&self, op: &MergeOp) -> error::Result<MergeCommit>;

    /// Read the rows of the table's current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) if the table is
    /// missing or its data file cannot be read.
    fn read_table(&self, table: &TableIdent) -> error::Result<RecordBatch>;

    /// Read the rows of a specific snapshot of the table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SnapshotNotFound`](crate::error::StoreError::SnapshotNotFound)
    /// if the snapshot does not belong to the table.
    fn read_snapshot(&self, table: &TableIdent, snapshot: SnapshotId)
        -> error::Result<RecordBatch>;

    /// Snapshot log of the table, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn snapshots(&self, table: &TableIdent) -> error::Result<Vec<SnapshotInfo>>;

    /// Record the start of a pipeline run, returning its ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn start_run(&self, pipeline: &PipelineId, table: &TableIdent) -> error::Result<i64>;

    /// Finalize a pipeline run with its status and statistics.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats)
        -> error::Result<()>;

    /// Most recent runs of `pipeline`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on catalog failure.
    fn runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<RunRecord>>;
}
