//! Durable trigger queue consumer.
//!
//! Pops "run this batch" signals from the store and hands them to the
//! executor. A delivery that errors is re-enqueued until
//! `max_trigger_attempts`; after that the liveness sweep is the backstop.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::batch::executor::{BatchExecutor, ExecutionReport};
use crate::context::SyncContext;
use crate::error::SyncResult;

pub struct QueueConsumer {
    ctx: SyncContext,
    executor: BatchExecutor,
}

impl QueueConsumer {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            executor: BatchExecutor::new(ctx.clone()),
            ctx,
        }
    }

    /// Process queued signals until the queue is empty. Returns how many
    /// signals were consumed.
    pub async fn drain(&self) -> SyncResult<usize> {
        let max_attempts = self.ctx.config.worker.max_trigger_attempts.max(1);
        let mut consumed = 0;

        while let Some(mut signal) = self.ctx.store.dequeue_trigger()? {
            consumed += 1;
            signal.attempts += 1;

            match self.executor.execute(signal.batch_id).await {
                Ok(ExecutionReport::Processed { status, .. }) => {
                    tracing::debug!(batch_id = %signal.batch_id, %status, "Queued batch processed");
                }
                Ok(report) => {
                    tracing::debug!(batch_id = %signal.batch_id, ?report, "Queued batch skipped");
                }
                Err(e) if signal.attempts < max_attempts => {
                    tracing::warn!(
                        batch_id = %signal.batch_id,
                        attempts = signal.attempts,
                        error = %e,
                        "Batch execution failed, re-enqueueing"
                    );
                    self.ctx.store.enqueue_trigger(signal)?;
                    // Leave the retry for the next poll.
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        batch_id = %signal.batch_id,
                        attempts = signal.attempts,
                        error = %e,
                        "Batch execution failed, giving up on queued signal"
                    );
                }
            }
        }

        Ok(consumed)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_millis(self.ctx.config.worker.queue_poll_interval_ms.max(10));
        tracing::info!(interval_ms = interval.as_millis() as u64, "Queue consumer starting");
        let mut ticker = time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        tracing::error!(error = %e, "Queue drain failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Queue consumer received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
