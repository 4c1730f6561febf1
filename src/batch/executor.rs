//! Stateless batch worker.
//!
//! # Data Flow
//! ```text
//! execute(batch_id)
//!     → terminal already? respond idempotently
//!     → claim (pending → running, compare-and-swap)
//!     → validate_batch → apply_items under a checkpoint
//!         → any item error: roll back the checkpoint, batch failed
//!     → resolve, conditional on the claim still holding
//!         → store error: undo, return the batch to pending, raise
//!         → claim lost to the sweep: undo, report superseded
//!     → recompute task counts from the batch rows
//!     → last batch? aggregate, finalize task, finalize run
//!     → otherwise trigger the next pending batch
//! ```
//!
//! # Design Decisions
//! - All coordination goes through the store; any process may run any batch
//! - The claim and the task finalization are compare-and-swap, so a double
//!   trigger never processes a batch twice and never aggregates twice
//! - The terminal status write only lands while the batch is still running
//!   under this executor's claim, so a late executor cannot overwrite a batch
//!   the sweep already requeued
//! - Trigger failures are logged, never raised; the sweep is the backstop

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::apply::apply_items;
use crate::batch::checkpoint::{rollback_checkpoint, Checkpoint};
use crate::batch::planner::validate_batch;
use crate::batch::trigger::TriggerOutcome;
use crate::context::SyncContext;
use crate::coordinator::finalize::RunFinalizer;
use crate::error::{SyncError, SyncResult};
use crate::observability::metrics;
use crate::store::{Batch, BatchId, BatchResult, BatchStatus, SyncTask, TaskId, TaskResult, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionReport {
    /// The batch had already resolved; nothing was done.
    AlreadyProcessed { batch_id: BatchId, status: BatchStatus },
    /// Another executor holds the batch.
    AlreadyRunning { batch_id: BatchId },
    /// The claim was taken back while this executor ran; its changes were
    /// undone and the batch is left to whoever holds it now.
    Superseded { batch_id: BatchId },
    Processed {
        batch_id: BatchId,
        task_id: TaskId,
        status: BatchStatus,
        result: BatchResult,
        /// This executor aggregated the task.
        task_finalized: bool,
        next_trigger: Option<String>,
    },
}

pub struct BatchExecutor {
    ctx: SyncContext,
    finalizer: RunFinalizer,
}

impl BatchExecutor {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            finalizer: RunFinalizer::new(ctx.clone()),
            ctx,
        }
    }

    /// Process exactly one batch.
    pub async fn execute(&self, batch_id: BatchId) -> SyncResult<ExecutionReport> {
        let store = self.ctx.store.as_ref();
        let batch = self.load_batch(batch_id)?;

        if batch.status.is_terminal() {
            tracing::debug!(%batch_id, status = %batch.status, "Batch already processed");
            return Ok(ExecutionReport::AlreadyProcessed {
                batch_id,
                status: batch.status,
            });
        }

        let claimed_at = self.ctx.clock.now();
        if !store.claim_batch(batch_id, claimed_at)? {
            let current = self.load_batch(batch_id)?;
            tracing::info!(%batch_id, status = %current.status, "Batch claimed elsewhere");
            return Ok(if current.status.is_terminal() {
                ExecutionReport::AlreadyProcessed {
                    batch_id,
                    status: current.status,
                }
            } else {
                ExecutionReport::AlreadyRunning { batch_id }
            });
        }

        tracing::info!(
            task_id = %batch.task_id,
            %batch_id,
            batch_number = batch.batch_number,
            items = batch.payload.len(),
            "Processing batch"
        );
        let mut checkpoint = Checkpoint::new(batch_id, claimed_at);
        let processed = match self.process(batch, &mut checkpoint, claimed_at) {
            Ok(Some(processed)) => processed,
            Ok(None) => {
                tracing::warn!(%batch_id, "Batch was requeued while running, discarding this execution");
                self.undo(&checkpoint);
                metrics::record_batch_superseded();
                return Ok(ExecutionReport::Superseded { batch_id });
            }
            Err(e) => {
                tracing::error!(%batch_id, error = %e, "Batch execution failed, releasing claim");
                self.release_claim(batch_id, &checkpoint);
                return Err(e);
            }
        };
        let task_id = processed.task_id;
        metrics::record_batch_outcome(processed.status);

        let task_finalized = self.complete_task_if_resolved(task_id).await?;
        let next_trigger = if task_finalized {
            None
        } else {
            self.trigger_next(task_id).await?.map(|outcome| outcome.as_str().to_string())
        };

        Ok(ExecutionReport::Processed {
            batch_id,
            task_id,
            status: processed.status,
            result: processed.result.unwrap_or_default(),
            task_finalized,
            next_trigger,
        })
    }

    /// Validate and apply a claimed batch, then persist its outcome.
    ///
    /// Returns `None` when the batch is no longer held under `claimed_at`.
    fn process(
        &self,
        mut batch: Batch,
        checkpoint: &mut Checkpoint,
        claimed_at: DateTime<Utc>,
    ) -> SyncResult<Option<Batch>> {
        let store = self.ctx.store.as_ref();
        let (valid, issues) = validate_batch(&batch.payload);

        if valid {
            store.save_checkpoint(checkpoint)?;
            let result = apply_items(store, &batch.payload, checkpoint, self.ctx.clock.now());

            if result.errors.is_empty() {
                batch.status = BatchStatus::Completed;
            } else {
                rollback_checkpoint(store, checkpoint)?;
                *checkpoint = Checkpoint::new(checkpoint.id, checkpoint.created_at);
                batch.status = BatchStatus::Failed;
                batch.error_message = Some(result.errors.join("; "));
            }
            batch.result = Some(result);
        } else {
            tracing::warn!(batch_id = %batch.id, issues = ?issues, "Batch failed validation");
            batch.status = BatchStatus::Failed;
            batch.error_message = Some(issues.join("; "));
            batch.result = Some(BatchResult {
                errors: issues,
                ..Default::default()
            });
        }

        batch.completed_at = Some(self.ctx.clock.now());
        if !store.resolve_batch(&batch, claimed_at)? {
            return Ok(None);
        }
        if let Err(e) = store.delete_checkpoint(checkpoint.id) {
            tracing::warn!(batch_id = %batch.id, error = %e, "Failed to delete checkpoint of resolved batch");
        }

        tracing::info!(
            task_id = %batch.task_id,
            batch_id = %batch.id,
            batch_number = batch.batch_number,
            status = %batch.status,
            error = batch.error_message.as_deref().unwrap_or(""),
            "Batch resolved"
        );
        Ok(Some(batch))
    }

    /// Undo this execution's writes.
    fn undo(&self, checkpoint: &Checkpoint) {
        if checkpoint.is_empty() {
            return;
        }
        if let Err(e) = rollback_checkpoint(self.ctx.store.as_ref(), checkpoint) {
            tracing::error!(checkpoint_id = %checkpoint.id, error = %e, "Failed to roll back batch changes");
        }
    }

    /// Undo this execution and hand the batch back so a retry can claim it.
    fn release_claim(&self, batch_id: BatchId, checkpoint: &Checkpoint) {
        let store = self.ctx.store.as_ref();
        self.undo(checkpoint);
        if let Err(e) = store.delete_checkpoint(checkpoint.id) {
            tracing::warn!(%batch_id, error = %e, "Failed to delete checkpoint");
        }
        match store.requeue_batch(batch_id) {
            Ok(true) => tracing::info!(%batch_id, "Batch returned to pending"),
            Ok(false) => tracing::debug!(%batch_id, "Batch no longer running, nothing to release"),
            Err(e) => tracing::error!(%batch_id, error = %e, "Failed to return batch to pending, leaving it to the sweep"),
        }
    }

    /// Recompute the task's counts and, once every batch resolved, aggregate
    /// and finalize. Returns true only for the caller that finalized.
    pub async fn complete_task_if_resolved(&self, task_id: TaskId) -> SyncResult<bool> {
        let store = self.ctx.store.as_ref();
        let counts = store.batch_counts(task_id)?;
        if !store.record_batch_counts(task_id, counts)? {
            return Ok(false);
        }

        let task = self.load_task(task_id)?;
        if counts.resolved() < task.total_batches.max(counts.total()) {
            return Ok(false);
        }

        let batches = store.list_batches(task_id)?;
        let result = aggregate(&batches);
        let status = if result.success { TaskStatus::Completed } else { TaskStatus::Failed };
        if !store.finalize_task(task_id, status, result.clone(), self.ctx.clock.now())? {
            return Ok(false);
        }

        tracing::info!(
            %task_id,
            ?status,
            batches_completed = result.batches_completed,
            batches_failed = result.batches_failed,
            "Task finalized"
        );
        self.finalize_run(task, result).await;
        Ok(true)
    }

    async fn finalize_run(&self, task: SyncTask, result: TaskResult) {
        let mut run = task.run;
        run.task_id = Some(task.id);
        run.records_added += result.records_added;
        run.records_updated += result.records_updated;
        run.dependents_added += result.dependents_added;
        run.errors.extend(result.errors);

        if let Err(e) = self.finalizer.complete(run, task.backup.as_ref()).await {
            tracing::error!(task_id = %task.id, error = %e, "Batched run failed during finalization");
        }
    }

    /// Trigger the lowest pending batch unless one is already running.
    pub async fn trigger_next(&self, task_id: TaskId) -> SyncResult<Option<TriggerOutcome>> {
        let batches = self.ctx.store.list_batches(task_id)?;
        if batches.iter().any(|b| b.status == BatchStatus::Running) {
            return Ok(None);
        }
        let Some(next) = batches.iter().find(|b| b.status == BatchStatus::Pending) else {
            return Ok(None);
        };

        let outcome = self.ctx.trigger.trigger(task_id, next.id).await;
        if !outcome.is_success() {
            tracing::warn!(%task_id, batch_id = %next.id, "Next batch not triggered, leaving it to the sweep");
        }
        Ok(Some(outcome))
    }

    fn load_batch(&self, batch_id: BatchId) -> SyncResult<Batch> {
        self.ctx.store.get_batch(batch_id)?.ok_or_else(|| SyncError::NotFound {
            kind: "batch",
            id: batch_id.to_string(),
        })
    }

    fn load_task(&self, task_id: TaskId) -> SyncResult<SyncTask> {
        self.ctx.store.get_task(task_id)?.ok_or_else(|| SyncError::NotFound {
            kind: "task",
            id: task_id.to_string(),
        })
    }
}

/// Fold every batch's result into the task result.
pub fn aggregate(batches: &[Batch]) -> TaskResult {
    let mut result = TaskResult::default();
    for batch in batches {
        match batch.status {
            BatchStatus::Completed => result.batches_completed += 1,
            BatchStatus::Failed => result.batches_failed += 1,
            BatchStatus::Pending | BatchStatus::Running => {}
        }
        if let Some(batch_result) = &batch.result {
            if batch.status == BatchStatus::Completed {
                result.records_added += batch_result.added;
                result.records_updated += batch_result.updated;
                result.dependents_added += batch_result.dependents_added;
            }
        }
        if batch.status == BatchStatus::Failed {
            let message = batch.error_message.as_deref().unwrap_or("failed");
            result.errors.push(format!("batch {}: {}", batch.batch_number, message));
        }
    }
    result.success = result.batches_failed == 0;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn batch(number: u32, status: BatchStatus, added: usize, error: Option<&str>) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            batch_number: number,
            status,
            payload: Vec::new(),
            result: Some(BatchResult {
                added,
                ..Default::default()
            }),
            error_message: error.map(str::to_string),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_aggregate_counts_and_errors() {
        let result = aggregate(&[
            batch(1, BatchStatus::Completed, 50, None),
            batch(2, BatchStatus::Failed, 0, Some("duplicate key X")),
            batch(3, BatchStatus::Completed, 20, None),
        ]);
        assert_eq!(result.batches_completed, 2);
        assert_eq!(result.batches_failed, 1);
        assert_eq!(result.records_added, 70);
        assert_eq!(result.errors, vec!["batch 2: duplicate key X".to_string()]);
        assert!(!result.success);
    }
}
