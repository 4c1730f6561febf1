//! Liveness sweep over running tasks.
//!
//! Runs on a fixed interval independent of the executor chain. For every
//! running batched task:
//! - batches stuck in `running` past `stale_batch_secs` have their
//!   checkpoint rolled back and are returned to `pending`
//! - if any batch is still running the task is skipped (single-flight)
//! - if every batch resolved but the task never finalized, it is finalized
//! - otherwise the lowest-numbered pending batch is triggered

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time;

use crate::batch::checkpoint::rollback_checkpoint;
use crate::batch::executor::BatchExecutor;
use crate::clock::elapsed_between;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::store::{Batch, BatchId, BatchStatus, TaskId, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub tasks_scanned: usize,
    pub triggered: Vec<BatchId>,
    pub skipped_running: Vec<TaskId>,
    pub requeued: Vec<BatchId>,
    pub finalized: Vec<TaskId>,
}

pub struct TaskOrchestrator {
    ctx: SyncContext,
    executor: BatchExecutor,
}

impl TaskOrchestrator {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            executor: BatchExecutor::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let mut report = SweepReport::default();
        let tasks = self.ctx.store.list_tasks(Some(TaskStatus::Running))?;

        for task in tasks.into_iter().filter(|t| t.batching) {
            report.tasks_scanned += 1;

            let mut batches = self.ctx.store.list_batches(task.id)?;
            let mut recovered = false;
            for batch in batches.iter().filter(|b| self.is_stale(b)) {
                if self.recover_stale(batch)? {
                    report.requeued.push(batch.id);
                    recovered = true;
                }
            }
            if recovered {
                batches = self.ctx.store.list_batches(task.id)?;
            }

            if batches.iter().any(|b| b.status == BatchStatus::Running) {
                tracing::debug!(task_id = %task.id, "Batch in flight, skipping task");
                report.skipped_running.push(task.id);
                continue;
            }

            match batches.iter().find(|b| b.status == BatchStatus::Pending) {
                Some(next) => {
                    let outcome = self.ctx.trigger.trigger(task.id, next.id).await;
                    tracing::info!(
                        task_id = %task.id,
                        batch_id = %next.id,
                        batch_number = next.batch_number,
                        outcome = outcome.as_str(),
                        "Sweep triggered pending batch"
                    );
                    if outcome.is_success() {
                        report.triggered.push(next.id);
                    }
                }
                None => {
                    if self.executor.complete_task_if_resolved(task.id).await? {
                        tracing::info!(task_id = %task.id, "Sweep finalized resolved task");
                        report.finalized.push(task.id);
                    }
                }
            }
        }

        if report.tasks_scanned > 0 {
            tracing::info!(
                tasks = report.tasks_scanned,
                triggered = report.triggered.len(),
                requeued = report.requeued.len(),
                finalized = report.finalized.len(),
                "Liveness sweep complete"
            );
        }
        Ok(report)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.ctx.config.worker.sweep_interval_secs.max(1));
        tracing::info!(interval_secs = interval.as_secs(), "Task orchestrator starting");
        let mut ticker = time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Liveness sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Task orchestrator received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    fn is_stale(&self, batch: &Batch) -> bool {
        if batch.status != BatchStatus::Running {
            return false;
        }
        let Some(started_at) = batch.started_at else {
            return true;
        };
        elapsed_between(started_at, self.ctx.clock.now()).as_secs() >= self.ctx.config.worker.stale_batch_secs
    }

    /// Undo a stalled batch's partial work and make it pending again.
    fn recover_stale(&self, batch: &Batch) -> SyncResult<bool> {
        let store = self.ctx.store.as_ref();
        if let Some(checkpoint) = store.load_checkpoint(batch.id)? {
            rollback_checkpoint(store, &checkpoint)?;
            store.delete_checkpoint(checkpoint.id)?;
        }
        let requeued = store.requeue_batch(batch.id)?;
        if requeued {
            tracing::warn!(
                task_id = %batch.task_id,
                batch_id = %batch.id,
                batch_number = batch.batch_number,
                "Requeued stalled batch"
            );
        }
        Ok(requeued)
    }
}
