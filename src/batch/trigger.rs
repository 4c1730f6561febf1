//! Next-batch triggering.
//!
//! # Design Decisions
//! - `QueueTrigger` (default) writes a durable signal to the store; a worker
//!   consumes it and re-enqueues on failure, so the signal is retriable
//! - `HttpTrigger` posts to a worker with a short timeout; a timeout means
//!   the worker accepted the request and is still processing it

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::observability::metrics;
use crate::store::{BatchId, QueuedTrigger, Store, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Signal written to the durable queue.
    Enqueued,
    /// Worker responded with success.
    Delivered,
    /// No response within the timeout; treated as success.
    TimedOut,
    Failed,
}

impl TriggerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Delivered => "delivered",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }

    pub fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Asks some worker to execute a batch.
#[async_trait]
pub trait BatchTrigger: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn trigger(&self, task_id: TaskId, batch_id: BatchId) -> TriggerOutcome;
}

pub struct QueueTrigger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl QueueTrigger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl BatchTrigger for QueueTrigger {
    fn kind(&self) -> &'static str {
        "queue"
    }

    async fn trigger(&self, task_id: TaskId, batch_id: BatchId) -> TriggerOutcome {
        let signal = QueuedTrigger {
            task_id,
            batch_id,
            enqueued_at: self.clock.now(),
            attempts: 0,
        };
        let outcome = match self.store.enqueue_trigger(signal) {
            Ok(()) => {
                tracing::debug!(%task_id, %batch_id, "Batch trigger enqueued");
                TriggerOutcome::Enqueued
            }
            Err(e) => {
                tracing::error!(%task_id, %batch_id, error = %e, "Failed to enqueue batch trigger");
                TriggerOutcome::Failed
            }
        };
        metrics::record_trigger(self.kind(), outcome);
        outcome
    }
}

pub struct HttpTrigger {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTrigger {
    pub fn new(base_url: impl Into<String>, timeout: Duration, auth_token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn run_url(&self, batch_id: BatchId) -> String {
        format!("{}/internal/batches/{}/run", self.base_url.trim_end_matches('/'), batch_id)
    }
}

#[async_trait]
impl BatchTrigger for HttpTrigger {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn trigger(&self, task_id: TaskId, batch_id: BatchId) -> TriggerOutcome {
        let mut request = self.client.post(self.run_url(batch_id));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let outcome = match request.send().await {
            Ok(response) if response.status().is_success() => TriggerOutcome::Delivered,
            Ok(response) => {
                tracing::warn!(%task_id, %batch_id, status = %response.status(), "Batch trigger rejected");
                TriggerOutcome::Failed
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!(%task_id, %batch_id, "Batch trigger timed out, assuming accepted");
                TriggerOutcome::TimedOut
            }
            Err(e) => {
                tracing::warn!(%task_id, %batch_id, error = %e, "Batch trigger failed");
                TriggerOutcome::Failed
            }
        };
        metrics::record_trigger(self.kind(), outcome);
        outcome
    }
}
