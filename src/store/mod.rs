//! Persistent store subsystem.
//!
//! # Data Flow
//! ```text
//! SyncPlanner ──lookup by natural key──▶ Store
//! BatchExecutor ──claim / apply / checkpoint──▶ Store
//! TaskOrchestrator ──scan running tasks──▶ Store
//! BackupManager ──export / import snapshot──▶ Store
//! ```
//!
//! # Design Decisions
//! - The store is the only coordination medium between invocations; every
//!   process opens the same SQLite database
//! - Status transitions that can race (claim, resolve, finalize, requeue,
//!   dequeue) are single conditional statements, so they are
//!   compare-and-swap across processes
//! - Aggregates are recomputed from rows, never incremented

pub mod models;
pub mod sqlite;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::batch::checkpoint::Checkpoint;
use crate::coordinator::metrics::UpdateMetrics;

pub use sqlite::SqliteStore;
pub use models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored value is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("duplicate natural key {0}")]
    DuplicateKey(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable state shared by every invocation.
pub trait Store: Send + Sync {
    fn schema_version(&self) -> u32;

    // Records
    fn find_record_by_external_id(&self, external_id: &str) -> StoreResult<Option<StoredRecord>>;
    fn get_record(&self, id: RecordId) -> StoreResult<Option<StoredRecord>>;
    fn insert_record(&self, record: NewRecord, now: DateTime<Utc>) -> StoreResult<StoredRecord>;
    /// Replace the row with the same id.
    fn update_record(&self, record: &StoredRecord) -> StoreResult<()>;
    fn delete_record(&self, id: RecordId) -> StoreResult<bool>;
    fn count_records(&self) -> StoreResult<usize>;
    fn list_records(&self) -> StoreResult<Vec<StoredRecord>>;

    // Dependent rows
    fn insert_witness(&self, record_id: RecordId, name: &str, organization: Option<&str>) -> StoreResult<Witness>;
    fn insert_document(
        &self,
        record_id: RecordId,
        title: &str,
        url: Option<&str>,
        kind: Option<&str>,
    ) -> StoreResult<Document>;
    fn delete_dependent(&self, kind: DependentKind, id: i64) -> StoreResult<bool>;
    fn list_witnesses(&self, record_id: RecordId) -> StoreResult<Vec<Witness>>;
    fn list_documents(&self, record_id: RecordId) -> StoreResult<Vec<Document>>;

    // Derived associations
    /// Returns whether the stored set changed.
    fn replace_associations(&self, record_id: RecordId, committee_codes: &[String]) -> StoreResult<bool>;
    fn list_associations(&self) -> StoreResult<Vec<Association>>;

    // Tasks
    fn create_task(&self, task: &SyncTask) -> StoreResult<()>;
    fn get_task(&self, id: TaskId) -> StoreResult<Option<SyncTask>>;
    fn update_task(&self, task: &SyncTask) -> StoreResult<()>;
    fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<SyncTask>>;
    /// Overwrite a non-terminal task's batch counts. Returns false if the
    /// task is already terminal.
    fn record_batch_counts(&self, id: TaskId, counts: BatchCounts) -> StoreResult<bool>;
    /// Running → terminal. Returns false if another caller already finalized.
    fn finalize_task(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: TaskResult,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // Batches
    fn create_batches(&self, batches: &[Batch]) -> StoreResult<()>;
    fn get_batch(&self, id: BatchId) -> StoreResult<Option<Batch>>;
    /// Ordered by batch number.
    fn list_batches(&self, task_id: TaskId) -> StoreResult<Vec<Batch>>;
    /// Pending → running. Returns false if the batch was not pending.
    fn claim_batch(&self, id: BatchId, at: DateTime<Utc>) -> StoreResult<bool>;
    /// Running → pending, for stalled batches.
    fn requeue_batch(&self, id: BatchId) -> StoreResult<bool>;
    /// Write a claimed batch's terminal status and result. Returns false if
    /// the batch is no longer running under the claim taken at `claimed_at`.
    fn resolve_batch(&self, batch: &Batch, claimed_at: DateTime<Utc>) -> StoreResult<bool>;
    fn batch_counts(&self, task_id: TaskId) -> StoreResult<BatchCounts>;

    // Checkpoints
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()>;
    fn load_checkpoint(&self, id: Uuid) -> StoreResult<Option<Checkpoint>>;
    fn delete_checkpoint(&self, id: Uuid) -> StoreResult<()>;

    // Run log
    fn append_run_metrics(&self, metrics: &UpdateMetrics) -> StoreResult<()>;
    fn last_run_metrics(&self) -> StoreResult<Option<UpdateMetrics>>;
    fn list_run_metrics(&self) -> StoreResult<Vec<UpdateMetrics>>;

    // Durable trigger queue
    fn enqueue_trigger(&self, trigger: QueuedTrigger) -> StoreResult<()>;
    fn dequeue_trigger(&self) -> StoreResult<Option<QueuedTrigger>>;
    fn queue_len(&self) -> StoreResult<usize>;

    // Resilience state
    fn save_resilience_state(&self, name: &str, state: &ResilienceState) -> StoreResult<()>;
    fn load_resilience_state(&self, name: &str) -> StoreResult<Option<ResilienceState>>;

    // Whole-store snapshot
    fn export_snapshot(&self) -> StoreResult<StoreSnapshot>;
    fn import_snapshot(&self, snapshot: StoreSnapshot) -> StoreResult<()>;
    fn integrity_report(&self) -> StoreResult<IntegrityReport>;
}
