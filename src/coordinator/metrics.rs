//! Per-run metrics row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{SyncMode, TaskId};
use crate::validation::ValidationOutcome;

/// Created at run start, appended to the run log once at run end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetrics {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub records_checked: usize,
    pub records_added: usize,
    pub records_updated: usize,
    pub dependents_added: usize,
    pub associations_updated: usize,
    pub api_requests: u64,
    pub errors: Vec<String>,
    pub validation: Option<ValidationOutcome>,
    /// Set when the store was restored from the run's backup.
    pub rolled_back: bool,
    pub success: bool,
    /// Present for runs executed through the batch chain.
    pub task_id: Option<TaskId>,
}

impl UpdateMetrics {
    pub fn start(mode: SyncMode, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            start_time: now,
            end_time: None,
            records_checked: 0,
            records_added: 0,
            records_updated: 0,
            dependents_added: 0,
            associations_updated: 0,
            api_requests: 0,
            errors: Vec::new(),
            validation: None,
            rolled_back: false,
            success: false,
            task_id: None,
        }
    }

    pub fn finish(&mut self, success: bool, now: DateTime<Utc>) {
        self.success = success;
        self.end_time = Some(now);
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }

    pub fn validation_issues(&self) -> &[String] {
        self.validation.as_ref().map(|v| v.issues.as_slice()).unwrap_or(&[])
    }
}
