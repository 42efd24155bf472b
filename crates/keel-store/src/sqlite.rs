//! `SQLite`-cataloged implementation of [`TableStore`].
//!
//! The catalog (namespaces, tables, snapshot log, run history) lives in one
//! `SQLite` database behind a `Mutex<Connection>`. Table data is stored
//! copy-on-write: each snapshot owns an Arrow IPC file under the warehouse,
//! and a commit moves the table's current-snapshot pointer with a
//! compare-and-set inside a single immediate transaction.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDateTime, Utc};
use keel_types::ident::{Namespace, PipelineId, SnapshotId, StagedLocation, TableIdent, TableName};
use keel_types::merge::{MergeCommit, MergeOp, WriteMode};
use keel_types::run::{RunRecord, RunStats, RunStatus};
use keel_types::schema::TableSchema;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::backend::{SnapshotInfo, SnapshotOperation, StagingReceipt, TableMetadata, TableStore};
use crate::error::{self, StoreError};
use crate::ipc;
use crate::schema::{from_arrow_schema, to_arrow_schema};
use crate::upsert;

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idempotent DDL for catalog tables.
const CREATE_TABLES: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS catalog_tables (
    namespace TEXT NOT NULL REFERENCES namespaces(name),
    name TEXT NOT NULL,
    schema_json TEXT NOT NULL,
    current_snapshot_id INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, name)
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    table_name TEXT NOT NULL,
    parent_id INTEGER,
    operation TEXT NOT NULL,
    data_file TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    rows_inserted INTEGER NOT NULL DEFAULT 0,
    rows_updated INTEGER NOT NULL DEFAULT 0,
    committed_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_snapshots_table ON snapshots (namespace, table_name, id);

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    table_ident TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    rows_staged INTEGER DEFAULT 0,
    rows_inserted INTEGER DEFAULT 0,
    rows_updated INTEGER DEFAULT 0,
    snapshot_id INTEGER,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON pipeline_runs (pipeline, id);
";

/// On-disk locations used by a [`SqliteTableStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Root for staging files; batches land under `<base_path>/tmp`.
    pub base_path: PathBuf,
    /// Root for table data files.
    pub warehouse_path: PathBuf,
    /// Catalog database file.
    pub catalog_path: PathBuf,
}

impl StorageLayout {
    /// Layout with the catalog at `<warehouse_path>/catalog.db`.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>, warehouse_path: impl Into<PathBuf>) -> Self {
        let warehouse_path = warehouse_path.into();
        Self {
            base_path: base_path.into(),
            catalog_path: warehouse_path.join("catalog.db"),
            warehouse_path,
        }
    }

    #[must_use]
    pub fn with_catalog_path(mut self, catalog_path: impl Into<PathBuf>) -> Self {
        self.catalog_path = catalog_path.into();
        self
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.base_path.join("tmp")
    }
}

/// Snapshot about to be committed.
struct PendingSnapshot {
    operation: SnapshotOperation,
    data_file: String,
    row_count: u64,
    rows_inserted: u64,
    rows_updated: u64,
}

/// `SQLite`-cataloged table store.
///
/// Several stores (in one or many processes) may share a layout; commits
/// are serialized by `SQLite`'s write lock and the snapshot compare-and-set.
pub struct SqliteTableStore {
    conn: Mutex<Connection>,
    layout: StorageLayout,
    #[cfg(test)]
    fail_next_commit: std::sync::atomic::AtomicBool,
}

impl SqliteTableStore {
    /// Open or create the catalog and directories described by `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a directory can't be created, or a
    /// catalog error if the database can't be opened or initialized.
    pub fn open(layout: StorageLayout) -> error::Result<Self> {
        if let Some(parent) = layout.catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&layout.warehouse_path)?;
        std::fs::create_dir_all(layout.staging_dir())?;

        let conn = Connection::open(&layout.catalog_path)
            .map_err(|e| StoreError::context("open catalog", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StoreError::context("open catalog", e))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::context("initialize catalog", e))?;

        tracing::debug!(
            catalog = %layout.catalog_path.display(),
            warehouse = %layout.warehouse_path.display(),
            "Table store opened"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            layout,
            #[cfg(test)]
            fail_next_commit: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    fn staging_path(&self, location: &StagedLocation) -> PathBuf {
        self.layout.staging_dir().join(format!("{location}.arrow"))
    }

    /// Fresh data file path for `table`, relative to the warehouse.
    fn new_data_file(table: &TableIdent) -> String {
        format!(
            "{}/{}/data/{}.arrow",
            table.namespace,
            table.name,
            uuid::Uuid::new_v4()
        )
    }

    fn warehouse_file(&self, relative: &str) -> PathBuf {
        self.layout.warehouse_path.join(relative)
    }

    /// Remove a data file that never became part of a committed snapshot.
    fn discard_data_file(&self, relative: &str) {
        let path = self.warehouse_file(relative);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(file = %path.display(), error = %e, "Failed to remove orphaned data file");
        }
    }

    fn table_exists_locked(conn: &Connection, table: &TableIdent) -> error::Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM catalog_tables WHERE namespace = ?1 AND name = ?2",
                rusqlite::params![table.namespace.as_str(), table.name.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| StoreError::context("table_exists", e))?;
        Ok(found.is_some())
    }

    fn namespace_exists_locked(conn: &Connection, namespace: &Namespace) -> error::Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM namespaces WHERE name = ?1",
                [namespace.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| StoreError::context("namespace_exists", e))?;
        Ok(found.is_some())
    }

    /// Insert a snapshot row and move the table's pointer from `expected`
    /// to it, all in one transaction. With `register`, the catalog entry is
    /// created in the same transaction.
    fn commit_snapshot(
        &self,
        table: &TableIdent,
        expected: Option<SnapshotId>,
        pending: &PendingSnapshot,
        register: Option<&TableSchema>,
    ) -> error::Result<SnapshotId> {
        let ns = table.namespace.as_str();
        let name = table.name.as_str();
        let expected_raw = expected.map(SnapshotId::get);

        let conn = self.lock_conn()?;
        let tx = match Transaction::new_unchecked(&conn, TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            // Another writer kept the commit lock past the busy timeout.
            Err(e) if is_busy(&e) => {
                tracing::debug!(table = %table, error = %e, "Commit lock busy");
                return Err(Self::conflict_with_current(&conn, table, expected));
            }
            Err(e) => return Err(StoreError::context("commit: begin", e)),
        };

        if let Some(schema) = register {
            let schema_json = serde_json::to_string(schema)?;
            let registered = tx
                .execute(
                    "INSERT OR IGNORE INTO catalog_tables (namespace, name, schema_json) \
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![ns, name, schema_json],
                )
                .map_err(|e| StoreError::context("commit: register table", e))?;
            if registered == 0 {
                return Err(StoreError::TableAlreadyExists(table.clone()));
            }
        }

        tx.execute(
            "INSERT INTO snapshots \
             (namespace, table_name, parent_id, operation, data_file, row_count, \
              rows_inserted, rows_updated, committed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                ns,
                name,
                expected_raw,
                pending.operation.as_str(),
                pending.data_file,
                to_sql_count(pending.row_count),
                to_sql_count(pending.rows_inserted),
                to_sql_count(pending.rows_updated),
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StoreError::context("commit: insert snapshot", e))?;
        let snapshot = SnapshotId::new(tx.last_insert_rowid());

        let swapped = tx
            .execute(
                "UPDATE catalog_tables SET current_snapshot_id = ?1 \
                 WHERE namespace = ?2 AND name = ?3 AND current_snapshot_id IS ?4",
                rusqlite::params![snapshot.get(), ns, name, expected_raw],
            )
            .map_err(|e| StoreError::context("commit: swap pointer", e))?;
        if swapped == 0 {
            return Err(Self::conflict_with_current(&tx, table, expected));
        }

        #[cfg(test)]
        if self
            .fail_next_commit
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::Io(std::io::Error::other(
                "injected commit failure",
            )));
        }

        tx.commit()
            .map_err(|e| StoreError::context("commit: commit", e))?;
        Ok(snapshot)
    }

    /// The error for a commit that could not move the pointer off
    /// `expected`: a conflict naming the current snapshot, or
    /// `TableNotFound` if the table is gone.
    fn conflict_with_current(
        conn: &Connection,
        table: &TableIdent,
        expected: Option<SnapshotId>,
    ) -> StoreError {
        let actual: Result<Option<Option<i64>>, _> = conn
            .query_row(
                "SELECT current_snapshot_id FROM catalog_tables \
                 WHERE namespace = ?1 AND name = ?2",
                rusqlite::params![table.namespace.as_str(), table.name.as_str()],
                |row| row.get(0),
            )
            .optional();
        match actual {
            Ok(None) => StoreError::TableNotFound(table.clone()),
            Ok(Some(actual)) => StoreError::CommitConflict {
                table: table.clone(),
                expected,
                actual: actual.map(SnapshotId::new),
            },
            Err(e) => StoreError::context("commit: read pointer", e),
        }
    }

    /// Rows visible at the table's current snapshot.
    fn read_current(&self, metadata: &TableMetadata) -> error::Result<RecordBatch> {
        match metadata.current_snapshot {
            Some(snapshot) => self.read_snapshot_of(metadata, snapshot),
            None => Ok(RecordBatch::new_empty(to_arrow_schema(&metadata.schema))),
        }
    }

    fn read_snapshot_of(
        &self,
        metadata: &TableMetadata,
        snapshot: SnapshotId,
    ) -> error::Result<RecordBatch> {
        let data_file: Option<String> = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT data_file FROM snapshots \
                 WHERE id = ?1 AND namespace = ?2 AND table_name = ?3",
                rusqlite::params![
                    snapshot.get(),
                    metadata.ident.namespace.as_str(),
                    metadata.ident.name.as_str()
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::context("read_snapshot", e))?
        };
        let data_file = data_file.ok_or_else(|| StoreError::SnapshotNotFound {
            table: metadata.ident.clone(),
            snapshot,
        })?;
        ipc::read_file(
            &self.warehouse_file(&data_file),
            Some(to_arrow_schema(&metadata.schema)),
        )
    }

    #[cfg(test)]
    fn inject_commit_failure(&self) {
        self.fail_next_commit
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn data_file_count(&self, table: &TableIdent) -> usize {
        let dir = self
            .layout
            .warehouse_path
            .join(table.namespace.as_str())
            .join(table.name.as_str())
            .join("data");
        std::fs::read_dir(dir).map_or(0, Iterator::count)
    }
}

/// Whether `err` means another connection holds the database lock.
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn same_shape(a: &RecordBatch, b: &RecordBatch) -> bool {
    let (a, b) = (a.schema(), b.schema());
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

fn path_exists(path: &Path) -> error::Result<bool> {
    Ok(path.try_exists()?)
}

impl TableStore for SqliteTableStore {
    fn namespace_exists(&self, namespace: &Namespace) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        Self::namespace_exists_locked(&conn, namespace)
    }

    fn create_namespace(&self, namespace: &Namespace) -> error::Result<()> {
        namespace.validate()?;
        let conn = self.lock_conn()?;
        let created = conn
            .execute(
                "INSERT OR IGNORE INTO namespaces (name) VALUES (?1)",
                [namespace.as_str()],
            )
            .map_err(|e| StoreError::context("create_namespace", e))?;
        if created > 0 {
            tracing::info!(namespace = %namespace, "Namespace created");
        }
        Ok(())
    }

    fn table_exists(&self, table: &TableIdent) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        Self::table_exists_locked(&conn, table)
    }

    fn list_tables(&self, namespace: &Namespace) -> error::Result<Vec<TableName>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM catalog_tables WHERE namespace = ?1 ORDER BY name")
            .map_err(|e| StoreError::context("list_tables", e))?;
        let names = stmt
            .query_map([namespace.as_str()], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::context("list_tables", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::context("list_tables", e))?;
        Ok(names.into_iter().map(TableName::new).collect())
    }

    fn load_table(&self, table: &TableIdent) -> error::Result<TableMetadata> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT schema_json, current_snapshot_id, created_at \
                 FROM catalog_tables WHERE namespace = ?1 AND name = ?2",
                rusqlite::params![table.namespace.as_str(), table.name.as_str()],
                |row| {
                    let schema_json: String = row.get(0)?;
                    let current: Option<i64> = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    Ok((schema_json, current, created_at))
                },
            )
            .optional()
            .map_err(|e| StoreError::context("load_table", e))?;
        let Some((schema_json, current, created_at)) = row else {
            return Err(StoreError::TableNotFound(table.clone()));
        };
        Ok(TableMetadata {
            ident: table.clone(),
            schema: serde_json::from_str(&schema_json)?,
            current_snapshot: current.map(SnapshotId::new),
            created_at: Self::sqlite_to_iso8601(&created_at),
        })
    }

    fn create_table(
        &self,
        table: &TableIdent,
        schema: &TableSchema,
        initial_rows: &RecordBatch,
    ) -> error::Result<TableMetadata> {
        table.validate()?;
        let mismatch = |detail| StoreError::SchemaMismatch {
            target: table.to_string(),
            detail,
        };
        if schema.is_empty() {
            return Err(mismatch("table schema has no columns".to_string()));
        }
        let provided = from_arrow_schema(&initial_rows.schema()).map_err(mismatch)?;
        if let Some(detail) = schema.mismatch(&provided) {
            return Err(mismatch(detail));
        }
        {
            let conn = self.lock_conn()?;
            if !Self::namespace_exists_locked(&conn, &table.namespace)? {
                return Err(StoreError::NamespaceNotFound(table.namespace.clone()));
            }
            if Self::table_exists_locked(&conn, table)? {
                return Err(StoreError::TableAlreadyExists(table.clone()));
            }
        }

        // Rebind to the declared schema so stored nullability matches the catalog.
        let rows = RecordBatch::try_new(to_arrow_schema(schema), initial_rows.columns().to_vec())?;
        let data_file = Self::new_data_file(table);
        ipc::write_atomic(&self.warehouse_file(&data_file), &rows)?;

        let row_count = rows.num_rows() as u64;
        let pending = PendingSnapshot {
            operation: SnapshotOperation::Create,
            data_file,
            row_count,
            rows_inserted: row_count,
            rows_updated: 0,
        };
        let snapshot = match self.commit_snapshot(table, None, &pending, Some(schema)) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.discard_data_file(&pending.data_file);
                return Err(err);
            }
        };
        tracing::info!(
            table = %table,
            snapshot = %snapshot,
            rows = row_count,
            "Table created"
        );
        self.load_table(table)
    }

    fn write_staging(
        &self,
        location: &StagedLocation,
        rows: &RecordBatch,
        mode: WriteMode,
    ) -> error::Result<StagingReceipt> {
        location.validate()?;
        let path = self.staging_path(location);
        let rows = match mode {
            WriteMode::Append if path_exists(&path)? => {
                let existing = ipc::read_file(&path, None)?;
                if !same_shape(&existing, rows) {
                    return Err(StoreError::SchemaMismatch {
                        target: format!("staging location '{location}'"),
                        detail: "appended rows differ in column names or types".to_string(),
                    });
                }
                concat_batches(&existing.schema(), [&existing, rows])?
            }
            WriteMode::Append | WriteMode::Overwrite => rows.clone(),
        };
        let bytes_written = ipc::write_atomic(&path, &rows)?;
        tracing::debug!(
            location = %location,
            rows = rows.num_rows(),
            bytes = bytes_written,
            mode = ?mode,
            "Staging location written"
        );
        Ok(StagingReceipt {
            location: location.clone(),
            path,
            row_count: rows.num_rows() as u64,
            bytes_written,
        })
    }

    fn read_staging(&self, location: &StagedLocation) -> error::Result<RecordBatch> {
        location.validate()?;
        let path = self.staging_path(location);
        if !path_exists(&path)? {
            return Err(StoreError::StagingNotFound(location.clone()));
        }
        ipc::read_file(&path, None)
    }

    fn transactional_merge(&self, op: &MergeOp) -> error::Result<MergeCommit> {
        let metadata = self.load_table(&op.target)?;
        let source = self.read_staging(&op.source)?;
        let target = self.read_current(&metadata)?;

        let output = upsert::apply_upsert(&target, &source, &op.key).map_err(|e| match e {
            StoreError::SchemaMismatch { detail, .. } => StoreError::SchemaMismatch {
                target: op.target.to_string(),
                detail,
            },
            other => other,
        })?;

        let data_file = Self::new_data_file(&op.target);
        ipc::write_atomic(&self.warehouse_file(&data_file), &output.batch)?;
        let pending = PendingSnapshot {
            operation: SnapshotOperation::Merge,
            data_file,
            row_count: output.batch.num_rows() as u64,
            rows_inserted: output.inserted,
            rows_updated: output.updated,
        };

        match self.commit_snapshot(&op.target, metadata.current_snapshot, &pending, None) {
            Ok(snapshot_id) => {
                tracing::debug!(
                    table = %op.target,
                    source = %op.source,
                    snapshot = %snapshot_id,
                    inserted = output.inserted,
                    updated = output.updated,
                    "Merge snapshot committed"
                );
                Ok(MergeCommit {
                    snapshot_id,
                    parent_id: metadata.current_snapshot,
                    inserted: output.inserted,
                    updated: output.updated,
                })
            }
            Err(err) => {
                self.discard_data_file(&pending.data_file);
                Err(err)
            }
        }
    }

    fn read_table(&self, table: &TableIdent) -> error::Result<RecordBatch> {
        let metadata = self.load_table(table)?;
        self.read_current(&metadata)
    }

    fn read_snapshot(
        &self,
        table: &TableIdent,
        snapshot: SnapshotId,
    ) -> error::Result<RecordBatch> {
        let metadata = self.load_table(table)?;
        self.read_snapshot_of(&metadata, snapshot)
    }

    fn snapshots(&self, table: &TableIdent) -> error::Result<Vec<SnapshotInfo>> {
        // Surfaces TableNotFound instead of an empty log.
        self.load_table(table)?;
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, parent_id, operation, data_file, row_count, rows_inserted, \
                 rows_updated, committed_at \
                 FROM snapshots WHERE namespace = ?1 AND table_name = ?2 ORDER BY id",
            )
            .map_err(|e| StoreError::context("snapshots", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![table.namespace.as_str(), table.name.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .map_err(|e| StoreError::context("snapshots", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::context("snapshots", e))?;

        rows.into_iter()
            .map(
                |(id, parent, operation, data_file, row_count, inserted, updated, committed)|
                 -> error::Result<SnapshotInfo> {
                    Ok(SnapshotInfo {
                        id: SnapshotId::new(id),
                        parent_id: parent.map(SnapshotId::new),
                        operation: SnapshotOperation::parse(&operation).ok_or_else(|| {
                            StoreError::CorruptCatalog {
                                column: "snapshots.operation",
                                value: operation.clone(),
                            }
                        })?,
                        data_file,
                        row_count: from_sql_count(row_count),
                        rows_inserted: from_sql_count(inserted),
                        rows_updated: from_sql_count(updated),
                        committed_at: Self::sqlite_to_iso8601(&committed),
                    })
                },
            )
            .collect()
    }

    fn start_run(&self, pipeline: &PipelineId, table: &TableIdent) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipeline_runs (pipeline, table_ident, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                pipeline.as_str(),
                table.to_string(),
                RunStatus::Running.as_str()
            ],
        )
        .map_err(|e| StoreError::context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, finished_at = datetime('now'), \
             rows_staged = ?2, rows_inserted = ?3, rows_updated = ?4, snapshot_id = ?5, \
             error_message = ?6 WHERE id = ?7",
            rusqlite::params![
                status.as_str(),
                to_sql_count(stats.rows_staged),
                to_sql_count(stats.rows_inserted),
                to_sql_count(stats.rows_updated),
                stats.snapshot_id,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StoreError::context("complete_run", e))?;
        Ok(())
    }

    fn runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, pipeline, table_ident, status, started_at, finished_at, \
                 rows_staged, rows_inserted, rows_updated, snapshot_id, error_message \
                 FROM pipeline_runs WHERE pipeline = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| StoreError::context("runs", e))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str(), limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    RunStats {
                        rows_staged: from_sql_count(row.get(6)?),
                        rows_inserted: from_sql_count(row.get(7)?),
                        rows_updated: from_sql_count(row.get(8)?),
                        snapshot_id: row.get(9)?,
                        error_message: row.get(10)?,
                    },
                ))
            })
            .map_err(|e| StoreError::context("runs", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::context("runs", e))?;

        rows.into_iter()
            .map(
                |(run_id, pipeline, table, status, started_at, finished_at, stats)|
                 -> error::Result<RunRecord> {
                    let status = RunStatus::parse(&status).ok_or_else(|| {
                        StoreError::CorruptCatalog {
                            column: "pipeline_runs.status",
                            value: status.clone(),
                        }
                    })?;
                    Ok(RunRecord {
                        run_id,
                        pipeline,
                        table,
                        status,
                        started_at: Self::sqlite_to_iso8601(&started_at),
                        finished_at: finished_at.as_deref().map(Self::sqlite_to_iso8601),
                        stats,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{AsArray, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Int64Type, Schema};
    use keel_types::schema::{ColumnSchema, ColumnType};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqliteTableStore {
        let layout = StorageLayout::new(dir.path().join("base"), dir.path().join("warehouse"));
        SqliteTableStore::open(layout).unwrap()
    }

    fn table_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new("id", ColumnType::Int64, false),
            ColumnSchema::new("name", ColumnType::Utf8, true),
        ])
    }

    fn batch(rows: &[(i64, &str)]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let names: Vec<&str> = rows.iter().map(|(_, name)| *name).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    fn contents(batch: &RecordBatch) -> Vec<(i64, String)> {
        let ids = batch.column(0).as_primitive::<Int64Type>();
        let names = batch.column(1).as_string::<i32>();
        (0..batch.num_rows())
            .map(|i| (ids.value(i), names.value(i).to_string()))
            .collect()
    }

    fn employees() -> TableIdent {
        TableIdent::new("hr", "employees")
    }

    fn seeded(dir: &TempDir, rows: &[(i64, &str)]) -> SqliteTableStore {
        let store = open_store(dir);
        store.create_namespace(&Namespace::new("hr")).unwrap();
        store
            .create_table(&employees(), &table_schema(), &batch(rows))
            .unwrap();
        store
    }

    fn stage_and_merge(
        store: &SqliteTableStore,
        location: &str,
        rows: &[(i64, &str)],
    ) -> error::Result<MergeCommit> {
        let location = StagedLocation::new(location);
        store.write_staging(&location, &batch(rows), WriteMode::Overwrite)?;
        store.transactional_merge(&MergeOp::upsert(employees(), location, "id"))
    }

    #[test]
    fn create_namespace_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let ns = Namespace::new("hr");
        assert!(!store.namespace_exists(&ns).unwrap());
        store.create_namespace(&ns).unwrap();
        store.create_namespace(&ns).unwrap();
        assert!(store.namespace_exists(&ns).unwrap());
    }

    #[test]
    fn create_namespace_rejects_invalid_name() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let err = store.create_namespace(&Namespace::new("bad name")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
    }

    #[test]
    fn create_table_commits_first_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "ada"), (2, "grace")]);

        let metadata = store.load_table(&employees()).unwrap();
        assert_eq!(metadata.schema, table_schema());
        assert!(metadata.current_snapshot.is_some());
        assert!(metadata.created_at.ends_with('Z'));

        let snapshots = store.snapshots(&employees()).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].operation, SnapshotOperation::Create);
        assert_eq!(snapshots[0].parent_id, None);
        assert_eq!(snapshots[0].row_count, 2);
        assert_eq!(snapshots[0].rows_inserted, 2);

        let rows = store.read_table(&employees()).unwrap();
        assert_eq!(
            contents(&rows),
            vec![(1, "ada".to_string()), (2, "grace".to_string())]
        );
        // Declared nullability is carried into stored data.
        assert!(!rows.schema().field(0).is_nullable());
    }

    #[test]
    fn create_table_requires_namespace() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let err = store
            .create_table(&employees(), &table_schema(), &batch(&[]))
            .unwrap_err();
        assert!(matches!(err, StoreError::NamespaceNotFound(_)));
    }

    #[test]
    fn create_table_twice_reports_existing() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "ada")]);
        let err = store
            .create_table(&employees(), &table_schema(), &batch(&[(9, "x")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::TableAlreadyExists(_)));
        assert_eq!(store.read_table(&employees()).unwrap().num_rows(), 1);
        assert_eq!(store.data_file_count(&employees()), 1);
    }

    #[test]
    fn create_table_rejects_rows_not_matching_schema() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create_namespace(&Namespace::new("hr")).unwrap();
        let schema = TableSchema::new(vec![ColumnSchema::new("id", ColumnType::Int64, false)]);
        let err = store
            .create_table(&employees(), &schema, &batch(&[(1, "ada")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
        assert!(!store.table_exists(&employees()).unwrap());
    }

    #[test]
    fn list_tables_is_sorted_per_namespace() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[]);
        store
            .create_table(&TableIdent::new("hr", "badges"), &table_schema(), &batch(&[]))
            .unwrap();
        let names = store.list_tables(&Namespace::new("hr")).unwrap();
        assert_eq!(
            names,
            vec![TableName::new("badges"), TableName::new("employees")]
        );
        assert!(store.list_tables(&Namespace::new("ops")).unwrap().is_empty());
    }

    #[test]
    fn staging_overwrite_replaces_previous_contents() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let location = StagedLocation::new("employees");

        store
            .write_staging(&location, &batch(&[(1, "a"), (2, "b")]), WriteMode::Overwrite)
            .unwrap();
        let receipt = store
            .write_staging(&location, &batch(&[(3, "c")]), WriteMode::Overwrite)
            .unwrap();
        assert_eq!(receipt.row_count, 1);
        assert!(receipt.bytes_written > 0);
        assert!(receipt.path.starts_with(dir.path().join("base").join("tmp")));

        let staged = store.read_staging(&location).unwrap();
        assert_eq!(contents(&staged), vec![(3, "c".to_string())]);
    }

    #[test]
    fn staging_append_accumulates_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let location = StagedLocation::new("employees");

        store
            .write_staging(&location, &batch(&[(1, "a")]), WriteMode::Append)
            .unwrap();
        let receipt = store
            .write_staging(&location, &batch(&[(2, "b")]), WriteMode::Append)
            .unwrap();
        assert_eq!(receipt.row_count, 2);
        assert_eq!(store.read_staging(&location).unwrap().num_rows(), 2);
    }

    #[test]
    fn staging_append_rejects_different_shape() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let location = StagedLocation::new("employees");
        store
            .write_staging(&location, &batch(&[(1, "a")]), WriteMode::Overwrite)
            .unwrap();

        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)])),
            vec![Arc::new(Int64Array::from(vec![2]))],
        )
        .unwrap();
        let err = store
            .write_staging(&location, &other, WriteMode::Append)
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
        assert_eq!(store.read_staging(&location).unwrap().num_rows(), 1);
    }

    #[test]
    fn read_missing_staging_location() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let err = store
            .read_staging(&StagedLocation::new("nothing"))
            .unwrap_err();
        assert!(matches!(err, StoreError::StagingNotFound(_)));
    }

    #[test]
    fn merge_updates_matches_and_inserts_new_keys() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(3, "old-3"), (5, "old-5")]);

        let commit = stage_and_merge(&store, "employees", &[(3, "new-3"), (7, "new-7")]).unwrap();
        assert_eq!(commit.updated, 1);
        assert_eq!(commit.inserted, 1);
        assert!(commit.parent_id.is_some());

        let rows = store.read_table(&employees()).unwrap();
        assert_eq!(
            contents(&rows),
            vec![
                (3, "new-3".to_string()),
                (5, "old-5".to_string()),
                (7, "new-7".to_string()),
            ]
        );
        let metadata = store.load_table(&employees()).unwrap();
        assert_eq!(metadata.current_snapshot, Some(commit.snapshot_id));
    }

    #[test]
    fn merge_with_duplicate_source_key_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "a")]);
        let before = store.load_table(&employees()).unwrap().current_snapshot;

        let err = stage_and_merge(&store, "employees", &[(9, "x"), (9, "y")]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidSource(upsert::KeyError::DuplicateKey { value: 9, .. })
        ));
        assert_eq!(store.load_table(&employees()).unwrap().current_snapshot, before);
        assert_eq!(store.data_file_count(&employees()), 1);
    }

    #[test]
    fn stale_commit_is_rejected_as_conflict() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "a")]);
        let base = store.load_table(&employees()).unwrap().current_snapshot;
        let first = stage_and_merge(&store, "employees", &[(2, "b")]).unwrap();

        let pending = PendingSnapshot {
            operation: SnapshotOperation::Merge,
            data_file: "hr/employees/data/stale.arrow".to_string(),
            row_count: 0,
            rows_inserted: 0,
            rows_updated: 0,
        };
        let err = store
            .commit_snapshot(&employees(), base, &pending, None)
            .unwrap_err();
        assert!(err.is_conflict());
        match err {
            StoreError::CommitConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, base);
                assert_eq!(actual, Some(first.snapshot_id));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // The rejected snapshot row was rolled back.
        assert_eq!(store.snapshots(&employees()).unwrap().len(), 2);
    }

    #[test]
    fn failed_commit_leaves_previous_state_visible() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(3, "old-3"), (5, "old-5")]);
        let before = store.load_table(&employees()).unwrap();

        store.inject_commit_failure();
        let err = stage_and_merge(&store, "employees", &[(3, "new-3"), (7, "new-7")]).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let after = store.load_table(&employees()).unwrap();
        assert_eq!(after.current_snapshot, before.current_snapshot);
        assert_eq!(store.snapshots(&employees()).unwrap().len(), 1);
        assert_eq!(store.data_file_count(&employees()), 1);
        assert_eq!(
            contents(&store.read_table(&employees()).unwrap()),
            vec![(3, "old-3".to_string()), (5, "old-5".to_string())]
        );
    }

    #[test]
    fn held_commit_lock_is_reported_as_conflict() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "a")]);
        let before = store.load_table(&employees()).unwrap().current_snapshot;
        store
            .lock_conn()
            .unwrap()
            .busy_timeout(Duration::from_millis(50))
            .unwrap();

        // A second writer takes the write lock and keeps it.
        let blocker = Connection::open(&store.layout().catalog_path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let err = stage_and_merge(&store, "employees", &[(2, "b")]).unwrap_err();
        assert!(err.is_conflict(), "got {err:?}");
        match err {
            StoreError::CommitConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, before);
                assert_eq!(actual, before);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.data_file_count(&employees()), 1);

        blocker.execute_batch("ROLLBACK;").unwrap();
        let commit = stage_and_merge(&store, "employees", &[(2, "b")]).unwrap();
        assert_eq!(commit.inserted, 1);
    }

    #[test]
    fn unrecognized_snapshot_operation_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "a")]);
        store
            .lock_conn()
            .unwrap()
            .execute("UPDATE snapshots SET operation = 'truncate'", [])
            .unwrap();

        let err = store.snapshots(&employees()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptCatalog {
                column: "snapshots.operation",
                ref value,
            } if value == "truncate"
        ));
    }

    #[test]
    fn unrecognized_run_status_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pipeline = PipelineId::new("hr_sync");
        store.start_run(&pipeline, &employees()).unwrap();
        store
            .lock_conn()
            .unwrap()
            .execute("UPDATE pipeline_runs SET status = 'paused'", [])
            .unwrap();

        let err = store.runs(&pipeline, 10).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptCatalog {
                column: "pipeline_runs.status",
                ..
            }
        ));
    }

    #[test]
    fn earlier_snapshots_remain_readable() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "a")]);
        let first = store.load_table(&employees()).unwrap().current_snapshot.unwrap();
        stage_and_merge(&store, "employees", &[(1, "z"), (2, "b")]).unwrap();

        let old = store.read_snapshot(&employees(), first).unwrap();
        assert_eq!(contents(&old), vec![(1, "a".to_string())]);

        let log = store.snapshots(&employees()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].parent_id, Some(first));
        assert_eq!(log[1].operation, SnapshotOperation::Merge);
        assert_eq!((log[1].rows_inserted, log[1].rows_updated), (1, 1));
    }

    #[test]
    fn snapshot_of_another_table_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, &[(1, "a")]);
        let other = TableIdent::new("hr", "badges");
        store
            .create_table(&other, &table_schema(), &batch(&[(7, "b")]))
            .unwrap();
        let badge_snapshot = store.load_table(&other).unwrap().current_snapshot.unwrap();

        let err = store.read_snapshot(&employees(), badge_snapshot).unwrap_err();
        assert!(matches!(err, StoreError::SnapshotNotFound { .. }));
    }

    #[test]
    fn unknown_table_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.load_table(&employees()).unwrap_err(),
            StoreError::TableNotFound(_)
        ));
        assert!(matches!(
            store.snapshots(&employees()).unwrap_err(),
            StoreError::TableNotFound(_)
        ));
    }

    #[test]
    fn catalog_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = seeded(&dir, &[(1, "a")]);
            stage_and_merge(&store, "employees", &[(2, "b")]).unwrap();
        }
        let store = open_store(&dir);
        assert!(store.table_exists(&employees()).unwrap());
        assert_eq!(store.read_table(&employees()).unwrap().num_rows(), 2);
    }

    #[test]
    fn run_lifecycle_is_recorded() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pipeline = PipelineId::new("hr_sync");

        let first = store.start_run(&pipeline, &employees()).unwrap();
        store
            .complete_run(
                first,
                RunStatus::Failed,
                &RunStats {
                    error_message: Some("boom".into()),
                    ..RunStats::default()
                },
            )
            .unwrap();
        let second = store.start_run(&pipeline, &employees()).unwrap();
        store
            .complete_run(
                second,
                RunStatus::Completed,
                &RunStats {
                    rows_staged: 3,
                    rows_inserted: 2,
                    rows_updated: 1,
                    snapshot_id: Some(4),
                    error_message: None,
                },
            )
            .unwrap();

        let runs = store.runs(&pipeline, 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, second);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].table, "hr.employees");
        assert_eq!(runs[0].stats.rows_inserted, 2);
        assert_eq!(runs[0].stats.snapshot_id, Some(4));
        assert!(runs[0].finished_at.is_some());
        assert_eq!(runs[1].stats.error_message.as_deref(), Some("boom"));

        assert_eq!(store.runs(&pipeline, 1).unwrap().len(), 1);
        assert!(store.runs(&PipelineId::new("other"), 10).unwrap().is_empty());
    }

    #[test]
    fn sqlite_datetime_converts_to_iso8601() {
        assert_eq!(
            SqliteTableStore::sqlite_to_iso8601("2026-03-01 12:30:00"),
            "2026-03-01T12:30:00Z"
        );
        assert_eq!(SqliteTableStore::sqlite_to_iso8601("garbage"), "garbage");
    }
}
