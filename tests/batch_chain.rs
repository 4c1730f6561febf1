//! Batch chain behavior: isolation, single-flight claims, stale recovery.

use std::time::Duration;

use record_sync::batch::planner::{parse_record, plan_batches};
use record_sync::batch::{
    BatchExecutor, BatchTrigger, Checkpoint, ExecutionReport, QueueConsumer, TaskOrchestrator, WorkItem,
};
use record_sync::clock::Clock;
use record_sync::coordinator::UpdateMetrics;
use record_sync::store::{Batch, BatchStatus, Store, SyncMode, SyncTask, TaskId, TaskStatus};
use record_sync::{RunOptions, RunOutcome, UpdateCoordinator};
use uuid::Uuid;

mod common;

use common::{upstream, upstream_many, Harness, ResolveFault};

fn seed_task(h: &Harness, count: usize, batch_size: usize) -> (TaskId, Vec<Batch>) {
    let task_id = Uuid::new_v4();
    let items = upstream_many(count)
        .into_iter()
        .map(|record| WorkItem::Add { record })
        .collect();
    let batches = plan_batches(task_id, items, batch_size);
    let now = h.clock.now();
    let task = SyncTask {
        id: task_id,
        mode: SyncMode::Full,
        status: TaskStatus::Running,
        batching: true,
        total_batches: batches.len() as u32,
        completed_batches: 0,
        failed_batches: 0,
        started_at: now,
        completed_at: None,
        result: None,
        backup: None,
        run: UpdateMetrics::start(SyncMode::Full, now),
    };
    h.store.create_task(&task).unwrap();
    h.store.create_batches(&batches).unwrap();
    (task_id, batches)
}

#[tokio::test]
async fn test_failed_batch_is_isolated_from_the_chain() {
    let mut records = upstream_many(120);
    // Indices 55 and 60 both land in batch 2.
    records[60].external_id = records[55].external_id.clone();
    let h = Harness::with_config(records, |c| c.sync.batch_size = 50);

    let outcome = UpdateCoordinator::new(h.ctx.clone())
        .run(RunOptions::new(SyncMode::Full))
        .await
        .unwrap();

    let (task_id, metrics) = match outcome {
        RunOutcome::Batched { task_id, metrics } => (task_id, metrics.expect("chain driven in-process")),
        other => panic!("expected batched run, got {other:?}"),
    };

    let batches = h.store.list_batches(task_id).unwrap();
    let sizes: Vec<usize> = batches.iter().map(|b| b.payload.len()).collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    let statuses: Vec<BatchStatus> = batches.iter().map(|b| b.status).collect();
    assert_eq!(
        statuses,
        vec![BatchStatus::Completed, BatchStatus::Failed, BatchStatus::Completed]
    );

    let task = h.store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let result = task.result.unwrap();
    assert_eq!(result.batches_completed, 2);
    assert_eq!(result.batches_failed, 1);
    assert!(!result.success);
    assert!(result.errors[0].starts_with("batch 2: duplicate key EV-0056"));

    assert_eq!(h.store.count_records().unwrap(), 70);
    assert_eq!(metrics.records_added, 70);
    assert_eq!(metrics.task_id, Some(task_id));
    assert!(!metrics.success);
    assert!(!metrics.rolled_back);
    assert_eq!(h.store.list_run_metrics().unwrap().len(), 1);
    assert!(h.notifier.titles().contains(&"Sync completed with errors".to_string()));
}

#[tokio::test]
async fn test_claimed_batch_is_not_processed_twice() {
    let h = Harness::new(Vec::new());
    let (_, batches) = seed_task(&h, 2, 1);
    let executor = BatchExecutor::new(h.ctx.clone());

    let first = batches[0].id;
    assert!(h.store.claim_batch(first, h.clock.now()).unwrap());
    assert_eq!(
        executor.execute(first).await.unwrap(),
        ExecutionReport::AlreadyRunning { batch_id: first }
    );

    let second = batches[1].id;
    let other = BatchExecutor::new(h.ctx.clone());
    let (a, b) = tokio::join!(executor.execute(second), other.execute(second));
    let processed = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(|r| matches!(r, ExecutionReport::Processed { .. }))
        .count();
    assert_eq!(processed, 1);
    assert_eq!(h.store.count_records().unwrap(), 1);

    assert!(matches!(
        executor.execute(second).await.unwrap(),
        ExecutionReport::AlreadyProcessed {
            status: BatchStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_sweep_recovers_stale_batch() {
    let h = Harness::with_config(Vec::new(), |c| c.worker.stale_batch_secs = 600);
    let (task_id, batches) = seed_task(&h, 1, 1);
    let batch_id = batches[0].id;
    let now = h.clock.now();

    // A worker claimed the batch, wrote one record, then died.
    assert!(h.store.claim_batch(batch_id, now).unwrap());
    let partial = h
        .store
        .insert_record(parse_record(&upstream("EV-0001", "Hearing 1")).unwrap(), now)
        .unwrap();
    let mut checkpoint = Checkpoint::new(batch_id, now);
    checkpoint.track_addition(partial.id);
    h.store.save_checkpoint(&checkpoint).unwrap();

    let orchestrator = TaskOrchestrator::new(h.ctx.clone());
    let report = orchestrator.sweep().await.unwrap();
    assert_eq!(report.skipped_running, vec![task_id]);
    assert!(report.requeued.is_empty());

    h.clock.advance(Duration::from_secs(601));
    let report = orchestrator.sweep().await.unwrap();
    assert_eq!(report.requeued, vec![batch_id]);
    assert_eq!(report.triggered, vec![batch_id]);
    assert_eq!(h.store.count_records().unwrap(), 0);
    assert_eq!(h.store.get_batch(batch_id).unwrap().unwrap().status, BatchStatus::Pending);
    assert_eq!(h.store.queue_len().unwrap(), 1);

    let consumed = QueueConsumer::new(h.ctx.clone()).drain().await.unwrap();
    assert_eq!(consumed, 1);
    assert_eq!(h.store.count_records().unwrap(), 1);
    let task = h.store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_sweep_finalizes_resolved_task() {
    let h = Harness::new(Vec::new());
    let (task_id, batches) = seed_task(&h, 1, 1);

    let mut batch = batches[0].clone();
    let claimed_at = h.clock.now();
    assert!(h.store.claim_batch(batch.id, claimed_at).unwrap());
    batch.status = BatchStatus::Completed;
    batch.completed_at = Some(claimed_at);
    assert!(h.store.resolve_batch(&batch, claimed_at).unwrap());

    let report = TaskOrchestrator::new(h.ctx.clone()).sweep().await.unwrap();
    assert_eq!(report.finalized, vec![task_id]);
    assert!(report.triggered.is_empty());

    let task = h.store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_batches, 1);

    let again = TaskOrchestrator::new(h.ctx.clone()).sweep().await.unwrap();
    assert_eq!(again.tasks_scanned, 0);
    assert_eq!(h.store.list_run_metrics().unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_error_after_claim_returns_batch_to_pending() {
    let h = Harness::new(Vec::new());
    let (task_id, batches) = seed_task(&h, 1, 1);
    let batch_id = batches[0].id;
    let (ctx, faulty) = h.with_faults();
    faulty.inject(ResolveFault::Fail);

    ctx.trigger.trigger(task_id, batch_id).await;
    let consumer = QueueConsumer::new(ctx.clone());
    assert_eq!(consumer.drain().await.unwrap(), 1);

    // The write that failed left nothing behind and the signal is kept.
    assert_eq!(h.store.count_records().unwrap(), 0);
    let batch = h.store.get_batch(batch_id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert!(batch.started_at.is_none());
    assert!(h.store.load_checkpoint(batch_id).unwrap().is_none());
    assert_eq!(h.store.queue_len().unwrap(), 1);

    assert_eq!(consumer.drain().await.unwrap(), 1);
    assert_eq!(h.store.count_records().unwrap(), 1);
    assert_eq!(h.store.get_batch(batch_id).unwrap().unwrap().status, BatchStatus::Completed);
    assert_eq!(h.store.get_task(task_id).unwrap().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_late_executor_cannot_resolve_requeued_batch() {
    let h = Harness::new(Vec::new());
    let (task_id, batches) = seed_task(&h, 1, 1);
    let batch_id = batches[0].id;
    let (ctx, faulty) = h.with_faults();
    faulty.inject(ResolveFault::Requeue);

    let report = BatchExecutor::new(ctx).execute(batch_id).await.unwrap();
    assert_eq!(report, ExecutionReport::Superseded { batch_id });

    let batch = h.store.get_batch(batch_id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert!(batch.result.is_none());
    assert_eq!(h.store.count_records().unwrap(), 0);
    assert_eq!(h.store.get_task(task_id).unwrap().unwrap().status, TaskStatus::Running);

    let rerun = BatchExecutor::new(h.ctx.clone()).execute(batch_id).await.unwrap();
    assert!(matches!(
        rerun,
        ExecutionReport::Processed {
            status: BatchStatus::Completed,
            task_finalized: true,
            ..
        }
    ));
    assert_eq!(h.store.count_records().unwrap(), 1);
}
