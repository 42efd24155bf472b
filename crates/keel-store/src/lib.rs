//! Table store for the keel ingestion pipeline.
//!
//! Provides the [`TableStore`] trait and a [`SqliteTableStore`]
//! implementation: a `SQLite` catalog of namespaces, tables, snapshots, and
//! pipeline runs, with copy-on-write Arrow IPC data files per snapshot and
//! overwrite-in-place staging files.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod ipc;
pub mod schema;
pub mod sqlite;
pub mod upsert;

pub use backend::{SnapshotInfo, SnapshotOperation, StagingReceipt, TableMetadata, TableStore};
pub use error::StoreError;
pub use sqlite::{SqliteTableStore, StorageLayout};

/// Common imports for store consumers.
pub mod prelude {
    pub use crate::backend::{
        SnapshotInfo, SnapshotOperation, StagingReceipt, TableMetadata, TableStore,
    };
    pub use crate::error::StoreError;
    pub use crate::sqlite::{SqliteTableStore, StorageLayout};
    pub use keel_types::ident::{Namespace, PipelineId, SnapshotId, StagedLocation, TableIdent};
    pub use keel_types::merge::{MergeCommit, MergeOp, WriteMode};
    pub use keel_types::run::{RunStats, RunStatus};
    pub use keel_types::schema::{ColumnSchema, ColumnType, TableSchema};
}
