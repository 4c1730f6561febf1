//! SQLite-backed store.
//!
//! Every process opens the same database file; WAL mode lets readers run
//! alongside the single writer and the busy timeout absorbs short write
//! contention. Status transitions are single conditional `UPDATE`s, so the
//! row the statement changed decides which caller won.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::batch::checkpoint::Checkpoint;
use crate::coordinator::metrics::UpdateMetrics;
use crate::store::models::*;
use crate::store::{Store, StoreError, StoreResult};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    chamber TEXT NOT NULL,
    congress INTEGER NOT NULL,
    title TEXT NOT NULL,
    date TEXT NOT NULL,
    status TEXT NOT NULL,
    location TEXT,
    committee_codes TEXT NOT NULL,
    last_modified TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS witnesses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    organization TEXT
);
CREATE INDEX IF NOT EXISTS idx_witnesses_record ON witnesses (record_id);
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    url TEXT,
    kind TEXT
);
CREATE INDEX IF NOT EXISTS idx_documents_record ON documents (record_id);
CREATE TABLE IF NOT EXISTS associations (
    record_id INTEGER NOT NULL,
    committee_code TEXT NOT NULL,
    PRIMARY KEY (record_id, committee_code)
);
CREATE TABLE IF NOT EXISTS tasks (
    id BLOB PRIMARY KEY,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    batching INTEGER NOT NULL,
    total_batches INTEGER NOT NULL,
    completed_batches INTEGER NOT NULL,
    failed_batches INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    result_json TEXT,
    backup_json TEXT,
    run_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE TABLE IF NOT EXISTS batches (
    id BLOB PRIMARY KEY,
    task_id BLOB NOT NULL,
    batch_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    result_json TEXT,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE (task_id, batch_number)
);
CREATE TABLE IF NOT EXISTS checkpoints (
    id BLOB PRIMARY KEY,
    checkpoint_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS run_metrics (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    metrics_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trigger_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id BLOB NOT NULL,
    batch_id BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS resilience_state (
    name TEXT PRIMARY KEY,
    state_json TEXT NOT NULL
);
";

const RECORD_COLUMNS: &str = "id, external_id, chamber, congress, title, date, status, location, \
     committee_codes, last_modified, created_at, updated_at";
const TASK_COLUMNS: &str = "id, mode, status, batching, total_batches, completed_batches, failed_batches, \
     started_at, completed_at, result_json, backup_json, run_json";
const BATCH_COLUMNS: &str =
    "id, task_id, batch_number, status, payload_json, result_json, error_message, started_at, completed_at";
const NOT_TERMINAL: &str = "status NOT IN ('completed', 'failed')";

pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    schema_version: u32,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self::with_connection(Some(path), conn)?;
        tracing::info!(
            path = %store.path.as_deref().unwrap_or(Path::new("")).display(),
            schema_version = store.schema_version,
            "Opened store"
        );
        Ok(store)
    }

    /// A private database that lives as long as this value.
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(None, Connection::open_in_memory()?)
    }

    /// Open `path`, or an in-memory database when the path is empty.
    pub fn open_or_memory(path: &str, busy_timeout: Duration) -> StoreResult<Self> {
        if path.trim().is_empty() {
            Self::in_memory()
        } else {
            Self::open(path, busy_timeout)
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_connection(path: Option<PathBuf>, conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let mut version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version == 0 {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            version = SCHEMA_VERSION;
        }
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            schema_version: version,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_text<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn opt_json<T: Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    Ok(value.as_ref().map(|v| serde_json::to_string(v)).transpose()?)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn query_all<T, P, F>(conn: &Connection, sql: &str, params: P, map: F) -> StoreResult<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        chamber: parse_text(row, 2)?,
        congress: row.get(3)?,
        fields: RecordFields {
            title: row.get(4)?,
            date: row.get(5)?,
            status: parse_text(row, 6)?,
            location: row.get(7)?,
        },
        committee_codes: json_column(row, 8)?,
        last_modified: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn witness_from_row(row: &Row<'_>) -> rusqlite::Result<Witness> {
    Ok(Witness {
        id: row.get(0)?,
        record_id: row.get(1)?,
        name: row.get(2)?,
        organization: row.get(3)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        record_id: row.get(1)?,
        title: row.get(2)?,
        url: row.get(3)?,
        kind: row.get(4)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<SyncTask> {
    Ok(SyncTask {
        id: row.get(0)?,
        mode: parse_text(row, 1)?,
        status: parse_text(row, 2)?,
        batching: row.get(3)?,
        total_batches: row.get(4)?,
        completed_batches: row.get(5)?,
        failed_batches: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        result: opt_json_column(row, 9)?,
        backup: opt_json_column(row, 10)?,
        run: json_column(row, 11)?,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: row.get(0)?,
        task_id: row.get(1)?,
        batch_number: row.get(2)?,
        status: parse_text(row, 3)?,
        payload: json_column(row, 4)?,
        result: opt_json_column(row, 5)?,
        error_message: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn insert_record_row(conn: &Connection, record: &StoredRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO records (id, external_id, chamber, congress, title, date, status, location,
                              committee_codes, last_modified, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.id,
            record.external_id,
            record.chamber.to_string(),
            record.congress,
            record.fields.title,
            record.fields.date,
            record.fields.status.to_string(),
            record.fields.location,
            serde_json::to_string(&record.committee_codes)?,
            record.last_modified,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn task_exists(conn: &Connection, id: TaskId) -> StoreResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn batch_exists(conn: &Connection, id: BatchId) -> StoreResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn not_found(kind: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl Store for SqliteStore {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn find_record_by_external_id(&self, external_id: &str) -> StoreResult<Option<StoredRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE external_id = ?1"),
                params![external_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_record(&self, id: RecordId) -> StoreResult<Option<StoredRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn insert_record(&self, record: NewRecord, now: DateTime<Utc>) -> StoreResult<StoredRecord> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO records (external_id, chamber, congress, title, date, status, location,
                                  committee_codes, last_modified, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                record.external_id,
                record.chamber.to_string(),
                record.congress,
                record.fields.title,
                record.fields.date,
                record.fields.status.to_string(),
                record.fields.location,
                serde_json::to_string(&record.committee_codes)?,
                record.last_modified,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::DuplicateKey(record.external_id)),
            Err(e) => return Err(e.into()),
        }

        Ok(StoredRecord {
            id: conn.last_insert_rowid(),
            external_id: record.external_id,
            chamber: record.chamber,
            congress: record.congress,
            fields: record.fields,
            committee_codes: record.committee_codes,
            last_modified: record.last_modified,
            created_at: now,
            updated_at: now,
        })
    }

    fn update_record(&self, record: &StoredRecord) -> StoreResult<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE records
             SET external_id = ?2, chamber = ?3, congress = ?4, title = ?5, date = ?6, status = ?7,
                 location = ?8, committee_codes = ?9, last_modified = ?10, created_at = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                record.id,
                record.external_id,
                record.chamber.to_string(),
                record.congress,
                record.fields.title,
                record.fields.date,
                record.fields.status.to_string(),
                record.fields.location,
                serde_json::to_string(&record.committee_codes)?,
                record.last_modified,
                record.created_at,
                record.updated_at,
            ],
        );
        match updated {
            Ok(0) => Err(not_found("record", record.id)),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateKey(record.external_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_record(&self, id: RecordId) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM associations WHERE record_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn count_records(&self) -> StoreResult<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn list_records(&self) -> StoreResult<Vec<StoredRecord>> {
        let conn = self.conn();
        query_all(
            &conn,
            &format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id"),
            [],
            record_from_row,
        )
    }

    fn insert_witness(&self, record_id: RecordId, name: &str, organization: Option<&str>) -> StoreResult<Witness> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO witnesses (record_id, name, organization) VALUES (?1, ?2, ?3)",
            params![record_id, name, organization],
        )?;
        Ok(Witness {
            id: conn.last_insert_rowid(),
            record_id,
            name: name.to_string(),
            organization: organization.map(str::to_string),
        })
    }

    fn insert_document(
        &self,
        record_id: RecordId,
        title: &str,
        url: Option<&str>,
        kind: Option<&str>,
    ) -> StoreResult<Document> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO documents (record_id, title, url, kind) VALUES (?1, ?2, ?3, ?4)",
            params![record_id, title, url, kind],
        )?;
        Ok(Document {
            id: conn.last_insert_rowid(),
            record_id,
            title: title.to_string(),
            url: url.map(str::to_string),
            kind: kind.map(str::to_string),
        })
    }

    fn delete_dependent(&self, kind: DependentKind, id: i64) -> StoreResult<bool> {
        let sql = match kind {
            DependentKind::Witness => "DELETE FROM witnesses WHERE id = ?1",
            DependentKind::Document => "DELETE FROM documents WHERE id = ?1",
        };
        let removed = self.conn().execute(sql, params![id])?;
        Ok(removed > 0)
    }

    fn list_witnesses(&self, record_id: RecordId) -> StoreResult<Vec<Witness>> {
        let conn = self.conn();
        query_all(
            &conn,
            "SELECT id, record_id, name, organization FROM witnesses WHERE record_id = ?1 ORDER BY id",
            params![record_id],
            witness_from_row,
        )
    }

    fn list_documents(&self, record_id: RecordId) -> StoreResult<Vec<Document>> {
        let conn = self.conn();
        query_all(
            &conn,
            "SELECT id, record_id, title, url, kind FROM documents WHERE record_id = ?1 ORDER BY id",
            params![record_id],
            document_from_row,
        )
    }

    fn replace_associations(&self, record_id: RecordId, committee_codes: &[String]) -> StoreResult<bool> {
        let mut codes: Vec<String> = committee_codes.to_vec();
        codes.sort();
        codes.dedup();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: Vec<String> = query_all(
            &tx,
            "SELECT committee_code FROM associations WHERE record_id = ?1 ORDER BY committee_code",
            params![record_id],
            |row| row.get(0),
        )?;
        if current == codes {
            return Ok(false);
        }

        tx.execute("DELETE FROM associations WHERE record_id = ?1", params![record_id])?;
        for code in &codes {
            tx.execute(
                "INSERT INTO associations (record_id, committee_code) VALUES (?1, ?2)",
                params![record_id, code],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn list_associations(&self) -> StoreResult<Vec<Association>> {
        let conn = self.conn();
        query_all(
            &conn,
            "SELECT record_id, committee_code FROM associations ORDER BY record_id, committee_code",
            [],
            |row| {
                Ok(Association {
                    record_id: row.get(0)?,
                    committee_code: row.get(1)?,
                })
            },
        )
    }

    fn create_task(&self, task: &SyncTask) -> StoreResult<()> {
        self.conn().execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                task.id,
                task.mode.to_string(),
                task.status.to_string(),
                task.batching,
                task.total_batches,
                task.completed_batches,
                task.failed_batches,
                task.started_at,
                task.completed_at,
                opt_json(&task.result)?,
                opt_json(&task.backup)?,
                serde_json::to_string(&task.run)?,
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> StoreResult<Option<SyncTask>> {
        let conn = self.conn();
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    fn update_task(&self, task: &SyncTask) -> StoreResult<()> {
        let updated = self.conn().execute(
            "UPDATE tasks
             SET mode = ?2, status = ?3, batching = ?4, total_batches = ?5, completed_batches = ?6,
                 failed_batches = ?7, started_at = ?8, completed_at = ?9, result_json = ?10,
                 backup_json = ?11, run_json = ?12
             WHERE id = ?1",
            params![
                task.id,
                task.mode.to_string(),
                task.status.to_string(),
                task.batching,
                task.total_batches,
                task.completed_batches,
                task.failed_batches,
                task.started_at,
                task.completed_at,
                opt_json(&task.result)?,
                opt_json(&task.backup)?,
                serde_json::to_string(&task.run)?,
            ],
        )?;
        if updated == 0 {
            return Err(not_found("task", task.id));
        }
        Ok(())
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<SyncTask>> {
        let conn = self.conn();
        match status {
            Some(status) => query_all(
                &conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY started_at, rowid"),
                params![status.to_string()],
                task_from_row,
            ),
            None => query_all(
                &conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY started_at, rowid"),
                [],
                task_from_row,
            ),
        }
    }

    fn record_batch_counts(&self, id: TaskId, counts: BatchCounts) -> StoreResult<bool> {
        let conn = self.conn();
        let written = conn.execute(
            &format!("UPDATE tasks SET completed_batches = ?2, failed_batches = ?3 WHERE id = ?1 AND {NOT_TERMINAL}"),
            params![id, counts.completed, counts.failed],
        )?;
        if written == 0 && !task_exists(&conn, id)? {
            return Err(not_found("task", id));
        }
        Ok(written > 0)
    }

    fn finalize_task(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: TaskResult,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn();
        let won = conn.execute(
            &format!(
                "UPDATE tasks
                 SET status = ?2, completed_batches = ?3, failed_batches = ?4, result_json = ?5, completed_at = ?6
                 WHERE id = ?1 AND {NOT_TERMINAL}"
            ),
            params![
                id,
                status.to_string(),
                result.batches_completed,
                result.batches_failed,
                serde_json::to_string(&result)?,
                at,
            ],
        )?;
        if won == 0 && !task_exists(&conn, id)? {
            return Err(not_found("task", id));
        }
        Ok(won > 0)
    }

    fn create_batches(&self, batches: &[Batch]) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for batch in batches {
            tx.execute(
                &format!("INSERT INTO batches ({BATCH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    batch.id,
                    batch.task_id,
                    batch.batch_number,
                    batch.status.to_string(),
                    serde_json::to_string(&batch.payload)?,
                    opt_json(&batch.result)?,
                    batch.error_message,
                    batch.started_at,
                    batch.completed_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_batch(&self, id: BatchId) -> StoreResult<Option<Batch>> {
        let conn = self.conn();
        let batch = conn
            .query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
                params![id],
                batch_from_row,
            )
            .optional()?;
        Ok(batch)
    }

    fn list_batches(&self, task_id: TaskId) -> StoreResult<Vec<Batch>> {
        let conn = self.conn();
        query_all(
            &conn,
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE task_id = ?1 ORDER BY batch_number"),
            params![task_id],
            batch_from_row,
        )
    }

    fn claim_batch(&self, id: BatchId, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn();
        let claimed = conn.execute(
            "UPDATE batches SET status = 'running', started_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, at],
        )?;
        if claimed == 0 && !batch_exists(&conn, id)? {
            return Err(not_found("batch", id));
        }
        Ok(claimed > 0)
    }

    fn requeue_batch(&self, id: BatchId) -> StoreResult<bool> {
        let requeued = self.conn().execute(
            "UPDATE batches SET status = 'pending', started_at = NULL WHERE id = ?1 AND status = 'running'",
            params![id],
        )?;
        Ok(requeued > 0)
    }

    fn resolve_batch(&self, batch: &Batch, claimed_at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn();
        let resolved = conn.execute(
            "UPDATE batches
             SET status = ?2, result_json = ?3, error_message = ?4, completed_at = ?5
             WHERE id = ?1 AND status = 'running' AND started_at = ?6",
            params![
                batch.id,
                batch.status.to_string(),
                opt_json(&batch.result)?,
                batch.error_message,
                batch.completed_at,
                claimed_at,
            ],
        )?;
        if resolved == 0 && !batch_exists(&conn, batch.id)? {
            return Err(not_found("batch", batch.id));
        }
        Ok(resolved > 0)
    }

    fn batch_counts(&self, task_id: TaskId) -> StoreResult<BatchCounts> {
        let conn = self.conn();
        let rows: Vec<(BatchStatus, u32)> = query_all(
            &conn,
            "SELECT status, COUNT(*) FROM batches WHERE task_id = ?1 GROUP BY status",
            params![task_id],
            |row| Ok((parse_text(row, 0)?, row.get(1)?)),
        )?;

        let mut counts = BatchCounts::default();
        for (status, count) in rows {
            match status {
                BatchStatus::Pending => counts.pending = count,
                BatchStatus::Running => counts.running = count,
                BatchStatus::Completed => counts.completed = count,
                BatchStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO checkpoints (id, checkpoint_json) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET checkpoint_json = excluded.checkpoint_json",
            params![checkpoint.id, serde_json::to_string(checkpoint)?],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, id: Uuid) -> StoreResult<Option<Checkpoint>> {
        let conn = self.conn();
        let checkpoint = conn
            .query_row(
                "SELECT checkpoint_json FROM checkpoints WHERE id = ?1",
                params![id],
                |row| json_column(row, 0),
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn delete_checkpoint(&self, id: Uuid) -> StoreResult<()> {
        self.conn().execute("DELETE FROM checkpoints WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn append_run_metrics(&self, metrics: &UpdateMetrics) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO run_metrics (run_id, metrics_json) VALUES (?1, ?2)",
            params![metrics.run_id.to_string(), serde_json::to_string(metrics)?],
        )?;
        Ok(())
    }

    fn last_run_metrics(&self) -> StoreResult<Option<UpdateMetrics>> {
        let log = self.list_run_metrics()?;
        Ok(log.into_iter().max_by_key(|m| m.end_time.unwrap_or(m.start_time)))
    }

    fn list_run_metrics(&self) -> StoreResult<Vec<UpdateMetrics>> {
        let conn = self.conn();
        query_all(&conn, "SELECT metrics_json FROM run_metrics ORDER BY seq", [], |row| {
            json_column(row, 0)
        })
    }

    fn enqueue_trigger(&self, trigger: QueuedTrigger) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO trigger_queue (task_id, batch_id, enqueued_at, attempts) VALUES (?1, ?2, ?3, ?4)",
            params![trigger.task_id, trigger.batch_id, trigger.enqueued_at, trigger.attempts],
        )?;
        Ok(())
    }

    fn dequeue_trigger(&self) -> StoreResult<Option<QueuedTrigger>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = tx
            .query_row(
                "SELECT seq, task_id, batch_id, enqueued_at, attempts FROM trigger_queue ORDER BY seq LIMIT 1",
                [],
                |row| {
                    let seq: i64 = row.get(0)?;
                    Ok((
                        seq,
                        QueuedTrigger {
                            task_id: row.get(1)?,
                            batch_id: row.get(2)?,
                            enqueued_at: row.get(3)?,
                            attempts: row.get(4)?,
                        },
                    ))
                },
            )
            .optional()?;
        let Some((seq, trigger)) = next else {
            return Ok(None);
        };
        tx.execute("DELETE FROM trigger_queue WHERE seq = ?1", params![seq])?;
        tx.commit()?;
        Ok(Some(trigger))
    }

    fn queue_len(&self) -> StoreResult<usize> {
        let conn = self.conn();
        let len: i64 = conn.query_row("SELECT COUNT(*) FROM trigger_queue", [], |row| row.get(0))?;
        Ok(len as usize)
    }

    fn save_resilience_state(&self, name: &str, state: &ResilienceState) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO resilience_state (name, state_json) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET state_json = excluded.state_json",
            params![name, serde_json::to_string(state)?],
        )?;
        Ok(())
    }

    fn load_resilience_state(&self, name: &str) -> StoreResult<Option<ResilienceState>> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT state_json FROM resilience_state WHERE name = ?1",
                params![name],
                |row| json_column(row, 0),
            )
            .optional()?;
        Ok(state)
    }

    fn export_snapshot(&self) -> StoreResult<StoreSnapshot> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let snapshot = StoreSnapshot {
            schema_version: self.schema_version,
            records: query_all(
                &tx,
                &format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id"),
                [],
                record_from_row,
            )?,
            witnesses: query_all(
                &tx,
                "SELECT id, record_id, name, organization FROM witnesses ORDER BY id",
                [],
                witness_from_row,
            )?,
            documents: query_all(
                &tx,
                "SELECT id, record_id, title, url, kind FROM documents ORDER BY id",
                [],
                document_from_row,
            )?,
            associations: query_all(
                &tx,
                "SELECT record_id, committee_code FROM associations ORDER BY record_id, committee_code",
                [],
                |row| {
                    Ok(Association {
                        record_id: row.get(0)?,
                        committee_code: row.get(1)?,
                    })
                },
            )?,
        };
        tx.commit()?;
        Ok(snapshot)
    }

    fn import_snapshot(&self, snapshot: StoreSnapshot) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DELETE FROM associations;
             DELETE FROM witnesses;
             DELETE FROM documents;
             DELETE FROM records;",
        )?;
        // AUTOINCREMENT keeps ids handed out after the snapshot from being reused.
        for record in &snapshot.records {
            insert_record_row(&tx, record)?;
        }
        for witness in &snapshot.witnesses {
            tx.execute(
                "INSERT INTO witnesses (id, record_id, name, organization) VALUES (?1, ?2, ?3, ?4)",
                params![witness.id, witness.record_id, witness.name, witness.organization],
            )?;
        }
        for document in &snapshot.documents {
            tx.execute(
                "INSERT INTO documents (id, record_id, title, url, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![document.id, document.record_id, document.title, document.url, document.kind],
            )?;
        }
        for association in &snapshot.associations {
            tx.execute(
                "INSERT INTO associations (record_id, committee_code) VALUES (?1, ?2)",
                params![association.record_id, association.committee_code],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn integrity_report(&self) -> StoreResult<IntegrityReport> {
        let conn = self.conn();
        Ok(IntegrityReport {
            orphaned_witnesses: query_all(
                &conn,
                "SELECT w.id FROM witnesses w LEFT JOIN records r ON r.id = w.record_id
                 WHERE r.id IS NULL ORDER BY w.id",
                [],
                |row| row.get(0),
            )?,
            orphaned_documents: query_all(
                &conn,
                "SELECT d.id FROM documents d LEFT JOIN records r ON r.id = d.record_id
                 WHERE r.id IS NULL ORDER BY d.id",
                [],
                |row| row.get(0),
            )?,
            orphaned_associations: query_all(
                &conn,
                "SELECT DISTINCT a.record_id FROM associations a LEFT JOIN records r ON r.id = a.record_id
                 WHERE r.id IS NULL ORDER BY a.record_id",
                [],
                |row| row.get(0),
            )?,
            duplicate_external_ids: query_all(
                &conn,
                "SELECT external_id FROM records WHERE trim(external_id) != ''
                 GROUP BY external_id HAVING COUNT(*) > 1 ORDER BY external_id",
                [],
                |row| row.get(0),
            )?,
            blank_external_ids: query_all(
                &conn,
                "SELECT id FROM records WHERE trim(external_id) = '' ORDER BY id",
                [],
                |row| row.get(0),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn new_record(key: &str) -> NewRecord {
        NewRecord {
            external_id: key.to_string(),
            chamber: Chamber::House,
            congress: 118,
            fields: RecordFields {
                title: format!("Hearing {key}"),
                date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                status: RecordStatus::Scheduled,
                location: Some("Room 2123".to_string()),
            },
            committee_codes: vec!["HSAG".to_string()],
            last_modified: None,
        }
    }

    fn pending_batch(task_id: TaskId, number: u32) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            task_id,
            batch_number: number,
            status: BatchStatus::Pending,
            payload: Vec::new(),
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn running_task(now: DateTime<Utc>) -> SyncTask {
        SyncTask {
            id: Uuid::new_v4(),
            mode: SyncMode::Full,
            status: TaskStatus::Running,
            batching: true,
            total_batches: 1,
            completed_batches: 0,
            failed_batches: 0,
            started_at: now,
            completed_at: None,
            result: None,
            backup: None,
            run: UpdateMetrics::start(SyncMode::Full, now),
        }
    }

    #[test]
    fn test_insert_and_lookup_by_natural_key() {
        let store = SqliteStore::in_memory().unwrap();
        let stored = store.insert_record(new_record("H-1"), Utc::now()).unwrap();
        let found = store.find_record_by_external_id("H-1").unwrap().unwrap();
        assert_eq!(found, stored);
        assert!(store.find_record_by_external_id("H-2").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_natural_key_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_record(new_record("H-1"), Utc::now()).unwrap();
        let err = store.insert_record(new_record("H-1"), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(key) if key == "H-1"));
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let first_id = {
            let store = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
            let record = store.insert_record(new_record("H-1"), Utc::now()).unwrap();
            store.insert_witness(record.id, "Jane Doe", Some("GAO")).unwrap();
            record.id
        };
        let reopened = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert_eq!(reopened.schema_version(), SCHEMA_VERSION);
        let record = reopened.find_record_by_external_id("H-1").unwrap().unwrap();
        assert_eq!(record.id, first_id);
        assert_eq!(reopened.list_witnesses(record.id).unwrap().len(), 1);
        let next = reopened.insert_record(new_record("H-2"), Utc::now()).unwrap();
        assert!(next.id > record.id);
    }

    #[test]
    fn test_separate_connections_share_coordination_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let worker = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        let runner = SqliteStore::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        let now = Utc::now();

        let task = running_task(now);
        runner.create_task(&task).unwrap();
        let batch = pending_batch(task.id, 1);
        runner.create_batches(std::slice::from_ref(&batch)).unwrap();

        assert_eq!(worker.get_batch(batch.id).unwrap().unwrap().status, BatchStatus::Pending);
        assert!(worker.claim_batch(batch.id, now).unwrap());
        assert!(!runner.claim_batch(batch.id, now).unwrap());

        worker
            .enqueue_trigger(QueuedTrigger {
                task_id: task.id,
                batch_id: batch.id,
                enqueued_at: now,
                attempts: 0,
            })
            .unwrap();
        assert!(runner.get_task(task.id).unwrap().is_some());
        assert!(runner.dequeue_trigger().unwrap().is_some());
        assert!(worker.dequeue_trigger().unwrap().is_none());
    }

    #[test]
    fn test_claim_and_resolve_are_conditional() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let task = running_task(now);
        store.create_task(&task).unwrap();
        let mut batch = pending_batch(task.id, 1);
        store.create_batches(std::slice::from_ref(&batch)).unwrap();

        assert!(store.claim_batch(batch.id, now).unwrap());
        assert!(!store.claim_batch(batch.id, now).unwrap());

        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(now);
        let other_claim = now + chrono::Duration::seconds(1);
        assert!(!store.resolve_batch(&batch, other_claim).unwrap());
        assert!(store.resolve_batch(&batch, now).unwrap());
        assert!(!store.resolve_batch(&batch, now).unwrap());
        assert_eq!(store.get_batch(batch.id).unwrap().unwrap().status, BatchStatus::Completed);

        assert!(matches!(
            store.claim_batch(Uuid::new_v4(), now),
            Err(StoreError::NotFound { kind: "batch", .. })
        ));
    }

    #[test]
    fn test_finalize_task_wins_once() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let task = running_task(now);
        store.create_task(&task).unwrap();

        let result = TaskResult {
            batches_completed: 1,
            success: true,
            ..Default::default()
        };
        assert!(store.finalize_task(task.id, TaskStatus::Completed, result.clone(), now).unwrap());
        assert!(!store.finalize_task(task.id, TaskStatus::Failed, result, now).unwrap());
        assert!(!store.record_batch_counts(task.id, BatchCounts::default()).unwrap());

        let stored = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.completed_batches, 1);
    }

    #[test]
    fn test_snapshot_round_trip_restores_domain_only() {
        let store = SqliteStore::in_memory().unwrap();
        let kept = store.insert_record(new_record("H-1"), Utc::now()).unwrap();
        let snapshot = store.export_snapshot().unwrap();

        let dropped = store.insert_record(new_record("H-2"), Utc::now()).unwrap();
        store
            .enqueue_trigger(QueuedTrigger {
                task_id: Uuid::new_v4(),
                batch_id: Uuid::new_v4(),
                enqueued_at: Utc::now(),
                attempts: 0,
            })
            .unwrap();

        store.import_snapshot(snapshot).unwrap();
        assert_eq!(store.list_records().unwrap(), vec![kept]);
        assert_eq!(store.queue_len().unwrap(), 1);

        // ids issued before the restore are not handed out again
        let next = store.insert_record(new_record("H-3"), Utc::now()).unwrap();
        assert!(next.id > dropped.id);
    }

    #[test]
    fn test_integrity_report_finds_orphans() {
        let store = SqliteStore::in_memory().unwrap();
        let record = store.insert_record(new_record("H-1"), Utc::now()).unwrap();
        store.insert_document(record.id, "Testimony", None, Some("testimony")).unwrap();
        store.replace_associations(record.id, &["HSAG".to_string()]).unwrap();
        assert!(store.integrity_report().unwrap().is_clean());

        store.delete_record(record.id).unwrap();
        let report = store.integrity_report().unwrap();
        assert_eq!(report.orphaned_documents.len(), 1);
        // associations are dropped with their record
        assert!(report.orphaned_associations.is_empty());
    }

    #[test]
    fn test_replace_associations_reports_changes() {
        let store = SqliteStore::in_memory().unwrap();
        let codes = vec!["B".to_string(), "A".to_string()];
        assert!(store.replace_associations(1, &codes).unwrap());
        assert!(!store.replace_associations(1, &["A".to_string(), "B".to_string()]).unwrap());
        assert!(store.replace_associations(1, &[]).unwrap());
        assert!(store.list_associations().unwrap().is_empty());
    }

    #[test]
    fn test_batch_counts_group_by_status() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let task = running_task(now);
        store.create_task(&task).unwrap();
        let batches: Vec<Batch> = (1..=3).map(|n| pending_batch(task.id, n)).collect();
        store.create_batches(&batches).unwrap();
        store.claim_batch(batches[0].id, now).unwrap();

        let counts = store.batch_counts(task.id).unwrap();
        assert_eq!((counts.pending, counts.running, counts.total()), (2, 1, 3));
        assert!(store.requeue_batch(batches[0].id).unwrap());
        assert!(!store.requeue_batch(batches[0].id).unwrap());
        assert_eq!(store.batch_counts(task.id).unwrap().pending, 3);
    }
}
