//! Top-level run sequencing.

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::batch::apply::apply_items;
use crate::batch::checkpoint::Checkpoint;
use crate::batch::planner::plan_batches;
use crate::batch::queue::QueueConsumer;
use crate::batch::orchestrator::TaskOrchestrator;
use crate::config::TriggerKind;
use crate::context::SyncContext;
use crate::coordinator::backup::Backup;
use crate::coordinator::finalize::RunFinalizer;
use crate::coordinator::metrics::UpdateMetrics;
use crate::coordinator::sanity::run_sanity_checks;
use crate::error::{SyncError, SyncResult};
use crate::notify::Severity;
use crate::store::{SyncMode, SyncTask, TaskId, TaskStatus};
use crate::sync::planner::{PlanSummary, SyncPlan, SyncPlanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: SyncMode,
    /// Plan only; nothing is mutated, backed up or validated.
    pub dry_run: bool,
    /// Skip the minimum-interval check.
    pub force: bool,
}

impl RunOptions {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            dry_run: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    DryRun { plan: PlanSummary },
    Completed { metrics: UpdateMetrics },
    /// Work was handed to the batch chain. `metrics` is present when the
    /// chain was driven to completion in this process.
    Batched { task_id: TaskId, metrics: Option<UpdateMetrics> },
}

pub struct UpdateCoordinator {
    ctx: SyncContext,
    finalizer: RunFinalizer,
}

impl UpdateCoordinator {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            finalizer: RunFinalizer::new(ctx.clone()),
            ctx,
        }
    }

    /// Sanity check, plan, back up, apply, validate, record.
    pub async fn run(&self, options: RunOptions) -> SyncResult<RunOutcome> {
        let mut run = UpdateMetrics::start(options.mode, self.ctx.clock.now());
        let requests_before = self.ctx.source.requests_made();
        tracing::info!(run_id = %run.run_id, mode = %options.mode, dry_run = options.dry_run, force = options.force, "Starting run");

        let failures = run_sanity_checks(
            self.ctx.store.as_ref(),
            &self.ctx.config.sanity,
            self.ctx.clock.now(),
            options.force,
        );
        if !failures.is_empty() {
            let err = SyncError::SanityCheck(failures);
            if !options.dry_run {
                self.finalizer.fail(run, None, &err).await;
            }
            return Err(err);
        }

        let planner = SyncPlanner::new(
            self.ctx.store.clone(),
            self.ctx.source.clone(),
            self.ctx.clock.clone(),
            self.ctx.config.sync.clone(),
        );
        let plan = match planner.plan(options.mode).await {
            Ok(plan) => plan,
            Err(err) => {
                if !options.dry_run {
                    run.api_requests = self.ctx.source.requests_made() - requests_before;
                    self.finalizer.fail(run, None, &err).await;
                }
                return Err(err);
            }
        };
        run.records_checked = plan.checked;
        run.errors.extend(plan.skipped.iter().map(|s| format!("skipped {s}")));
        run.api_requests = self.ctx.source.requests_made() - requests_before;

        if options.dry_run {
            let summary = plan.summary();
            tracing::info!(run_id = %run.run_id, ?summary, "Dry run, stopping before any mutation");
            return Ok(RunOutcome::DryRun { plan: summary });
        }

        let backup = self.take_backup(&run).await;

        let batched = !plan.is_empty()
            && (options.mode == SyncMode::Full || plan.len() > self.ctx.config.sync.batch_threshold);
        if batched {
            self.run_batched(run, plan, backup).await
        } else {
            self.run_direct(run, plan, backup).await
        }
    }

    /// A failed backup degrades the run instead of aborting it.
    async fn take_backup(&self, run: &UpdateMetrics) -> Option<Backup> {
        match self.finalizer.backups().create(self.ctx.store.as_ref()) {
            Ok(backup) => Some(backup),
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, error = %e, "Backup failed, continuing without rollback safety net");
                self.ctx
                    .notifier
                    .send(
                        "Sync running without backup",
                        &e.to_string(),
                        Severity::Warning,
                        json!({ "run_id": run.run_id, "mode": run.mode }),
                    )
                    .await;
                None
            }
        }
    }

    async fn run_direct(&self, mut run: UpdateMetrics, plan: SyncPlan, backup: Option<Backup>) -> SyncResult<RunOutcome> {
        let items = plan.into_work_items();
        let mut checkpoint = Checkpoint::new(Uuid::new_v4(), self.ctx.clock.now());
        let result = apply_items(self.ctx.store.as_ref(), &items, &mut checkpoint, self.ctx.clock.now());
        if let Err(e) = self.ctx.store.delete_checkpoint(checkpoint.id) {
            tracing::warn!(error = %e, "Failed to drop direct-run checkpoint");
        }

        run.records_added = result.added;
        run.records_updated = result.updated;
        run.dependents_added = result.dependents_added;
        run.errors.extend(result.errors);
        tracing::info!(
            run_id = %run.run_id,
            items = items.len(),
            added = run.records_added,
            updated = run.records_updated,
            "Applied changes directly"
        );

        let metrics = self.finalizer.complete(run, backup.as_ref()).await?;
        Ok(RunOutcome::Completed { metrics })
    }

    async fn run_batched(&self, run: UpdateMetrics, plan: SyncPlan, backup: Option<Backup>) -> SyncResult<RunOutcome> {
        let task_id = Uuid::new_v4();
        let batches = plan_batches(task_id, plan.into_work_items(), self.ctx.config.sync.batch_size);
        let task = SyncTask {
            id: task_id,
            mode: run.mode,
            status: TaskStatus::Running,
            batching: true,
            total_batches: batches.len() as u32,
            completed_batches: 0,
            failed_batches: 0,
            started_at: self.ctx.clock.now(),
            completed_at: None,
            result: None,
            backup: backup.clone(),
            run: run.clone(),
        };

        let created = self
            .ctx
            .store
            .create_task(&task)
            .and_then(|()| self.ctx.store.create_batches(&batches));
        if let Err(e) = created {
            let err = SyncError::from(e);
            self.finalizer.fail(run, backup.as_ref(), &err).await;
            return Err(err);
        }

        tracing::info!(
            run_id = %run.run_id,
            %task_id,
            batches = batches.len(),
            batch_size = self.ctx.config.sync.batch_size,
            "Created batched task"
        );
        if let Some(first) = batches.first() {
            let outcome = self.ctx.trigger.trigger(task_id, first.id).await;
            if !outcome.is_success() {
                tracing::warn!(%task_id, "First batch not triggered, the sweep will pick it up");
            }
        }

        let drive_here =
            self.ctx.config.sync.wait_for_batches && self.ctx.config.worker.trigger == TriggerKind::Queue;
        if !drive_here {
            return Ok(RunOutcome::Batched { task_id, metrics: None });
        }

        let metrics = self.drive_task(task_id).await?;
        Ok(RunOutcome::Batched { task_id, metrics })
    }

    /// Work the durable queue in this process until the task resolves.
    async fn drive_task(&self, task_id: TaskId) -> SyncResult<Option<UpdateMetrics>> {
        let consumer = QueueConsumer::new(self.ctx.clone());
        let orchestrator = TaskOrchestrator::new(self.ctx.clone());

        let max_stalled_rounds = self.ctx.config.worker.max_trigger_attempts.max(1) + 1;
        let mut stalled_rounds = 0;
        let mut last_resolved = 0;

        loop {
            let consumed = consumer.drain().await?;
            let task = self.ctx.store.get_task(task_id)?.ok_or_else(|| SyncError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })?;
            if task.status.is_terminal() {
                break;
            }

            let resolved = self.ctx.store.batch_counts(task_id)?.resolved();
            if resolved > last_resolved {
                last_resolved = resolved;
                stalled_rounds = 0;
            } else {
                stalled_rounds += 1;
            }
            if stalled_rounds >= max_stalled_rounds {
                tracing::warn!(%task_id, resolved, "Batch chain made no progress, leaving task to the worker");
                return Ok(None);
            }

            if consumed == 0 {
                orchestrator.sweep().await?;
            }
        }

        let metrics = self
            .ctx
            .store
            .list_run_metrics()?
            .into_iter()
            .rev()
            .find(|m| m.task_id == Some(task_id));
        Ok(metrics)
    }
}
