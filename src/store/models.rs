//! Persisted record, task and batch types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::types::WorkItem;
use crate::coordinator::backup::Backup;
use crate::coordinator::metrics::UpdateMetrics;
use crate::resilience::{BreakerSnapshot, RateLimiterSnapshot};

/// Surrogate id assigned by the store.
pub type RecordId = i64;
pub type TaskId = Uuid;
pub type BatchId = Uuid;

pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle of an upstream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Scheduled,
    Rescheduled,
    Postponed,
    Cancelled,
    Held,
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(Self::Scheduled),
            "rescheduled" => Ok(Self::Rescheduled),
            "postponed" => Ok(Self::Postponed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "held" | "completed" => Ok(Self::Held),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Rescheduled => "rescheduled",
            Self::Postponed => "postponed",
            Self::Cancelled => "cancelled",
            Self::Held => "held",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chamber {
    House,
    Senate,
    Joint,
}

impl FromStr for Chamber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "house" => Ok(Self::House),
            "senate" => Ok(Self::Senate),
            "joint" => Ok(Self::Joint),
            other => Err(format!("unknown chamber '{other}'")),
        }
    }
}

impl fmt::Display for Chamber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::House => "house",
            Self::Senate => "senate",
            Self::Joint => "joint",
        };
        f.write_str(s)
    }
}

/// The mutable fields compared during change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub title: String,
    pub date: NaiveDate,
    pub status: RecordStatus,
    pub location: Option<String>,
}

/// A record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    /// The upstream system's own identifier.
    pub external_id: String,
    pub chamber: Chamber,
    pub congress: u32,
    #[serde(flatten)]
    pub fields: RecordFields,
    pub committee_codes: Vec<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record ready for insertion; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub external_id: String,
    pub chamber: Chamber,
    pub congress: u32,
    pub fields: RecordFields,
    pub committee_codes: Vec<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub id: i64,
    pub record_id: RecordId,
    pub name: String,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub record_id: RecordId,
    pub title: String,
    pub url: Option<String>,
    pub kind: Option<String>,
}

/// Rows that hang off a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentKind {
    Witness,
    Document,
}

/// Derived cross-reference between a record and a committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub record_id: RecordId,
    pub committee_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Full,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(Self::Incremental),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incremental => f.write_str("incremental"),
            Self::Full => f.write_str("full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown batch status '{other}'")),
        }
    }
}

/// Aggregate result written once every batch of a task has resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub batches_completed: u32,
    pub batches_failed: u32,
    pub records_added: usize,
    pub records_updated: usize,
    pub dependents_added: usize,
    pub errors: Vec<String>,
    pub success: bool,
}

/// One synchronization job executed through the batch chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: TaskId,
    pub mode: SyncMode,
    pub status: TaskStatus,
    /// Whether the task is driven by the batch chain.
    pub batching: bool,
    pub total_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    /// Whole-store backup taken before the task mutated anything.
    pub backup: Option<Backup>,
    /// Run metrics accumulated before batching began; finalized with the task.
    pub run: UpdateMetrics,
}

/// Per-batch outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub added: usize,
    pub updated: usize,
    pub dependents_added: usize,
    pub errors: Vec<String>,
}

/// A bounded slice of a task's work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub task_id: TaskId,
    /// Unique per task; processed low to high.
    pub batch_number: u32,
    pub status: BatchStatus,
    pub payload: Vec<WorkItem>,
    pub result: Option<BatchResult>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Batch status tally for one task, always computed from the batch rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
}

impl BatchCounts {
    pub fn resolved(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn total(&self) -> u32 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// Durable "run this batch" signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTrigger {
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries already attempted.
    pub attempts: u32,
}

/// Limiter and breaker state persisted per upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceState {
    pub limiter: Option<RateLimiterSnapshot>,
    pub breaker: Option<BreakerSnapshot>,
}

/// Domain data captured by a whole-store backup. Coordination tables
/// (tasks, batches, queue, run log) are not included; restoring a snapshot
/// leaves them untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    pub records: Vec<StoredRecord>,
    pub witnesses: Vec<Witness>,
    pub documents: Vec<Document>,
    pub associations: Vec<Association>,
}

/// Result of an integrity scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub orphaned_witnesses: Vec<i64>,
    pub orphaned_documents: Vec<i64>,
    pub orphaned_associations: Vec<RecordId>,
    pub duplicate_external_ids: Vec<String>,
    pub blank_external_ids: Vec<RecordId>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violation_count() == 0
    }

    pub fn violation_count(&self) -> usize {
        self.orphaned_witnesses.len()
            + self.orphaned_documents.len()
            + self.orphaned_associations.len()
            + self.duplicate_external_ids.len()
            + self.blank_external_ids.len()
    }

    pub fn describe(&self) -> Vec<String> {
        let mut out = Vec::new();
        for id in &self.orphaned_witnesses {
            out.push(format!("witness {id} references a missing record"));
        }
        for id in &self.orphaned_documents {
            out.push(format!("document {id} references a missing record"));
        }
        for id in &self.orphaned_associations {
            out.push(format!("association references missing record {id}"));
        }
        for key in &self.duplicate_external_ids {
            out.push(format!("duplicate natural key {key}"));
        }
        for id in &self.blank_external_ids {
            out.push(format!("record {id} has a blank natural key"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_is_lenient() {
        assert_eq!("Canceled".parse::<RecordStatus>().unwrap(), RecordStatus::Cancelled);
        assert_eq!(" HELD ".parse::<RecordStatus>().unwrap(), RecordStatus::Held);
        assert!("unknown".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_status_text_round_trips() {
        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("running".parse::<BatchStatus>().unwrap(), BatchStatus::Running);
        assert_eq!(Chamber::Joint.to_string().parse::<Chamber>().unwrap(), Chamber::Joint);
    }

    #[test]
    fn test_batch_counts() {
        let counts = BatchCounts {
            pending: 1,
            running: 0,
            completed: 2,
            failed: 1,
        };
        assert_eq!(counts.resolved(), 3);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_integrity_report_describes_violations() {
        let report = IntegrityReport {
            orphaned_witnesses: vec![4],
            duplicate_external_ids: vec!["H-1".into()],
            ..Default::default()
        };
        assert!(!report.is_clean());
        assert_eq!(report.describe().len(), 2);
    }
}
