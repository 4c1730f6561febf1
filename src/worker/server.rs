//! Worker HTTP surface and background loops.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::api::client::PROTECTION_NAME;
use crate::batch::{BatchExecutor, ExecutionReport, QueueConsumer, TaskOrchestrator};
use crate::context::SyncContext;
use crate::coordinator::{RunOptions, RunOutcome, UpdateCoordinator};
use crate::error::SyncError;
use crate::lifecycle::Shutdown;
use crate::resilience::{CircuitBreaker, CircuitState, CircuitStats, RateLimiter};
use crate::store::{Batch, BatchId, BatchResult, BatchStatus, SyncMode, SyncTask, TaskId, TaskStatus};
use crate::worker::auth::bearer_auth_middleware;

/// Shared handler state.
#[derive(Clone)]
pub struct WorkerState {
    pub ctx: SyncContext,
    executor: Arc<BatchExecutor>,
    coordinator: Arc<UpdateCoordinator>,
    /// Held for the duration of a `POST /runs`.
    run_lock: Arc<Mutex<()>>,
}

impl WorkerState {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            executor: Arc::new(BatchExecutor::new(ctx.clone())),
            coordinator: Arc::new(UpdateCoordinator::new(ctx.clone())),
            run_lock: Arc::new(Mutex::new(())),
            ctx,
        }
    }
}

/// Handler error mapped onto a status code and a JSON body.
#[derive(Debug)]
pub enum WorkerError {
    Sync(SyncError),
    RunInProgress,
}

impl From<SyncError> for WorkerError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl From<crate::store::StoreError> for WorkerError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::Sync(err.into())
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::RunInProgress => (StatusCode::CONFLICT, "a run is already in progress".to_string()),
            Self::Sync(err) => {
                let status = match &err {
                    SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
                    SyncError::SanityCheck(_) => StatusCode::CONFLICT,
                    SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    SyncError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    SyncError::Upstream(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %message, "Worker request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Batch row without its payload.
#[derive(Debug, Serialize)]
pub struct BatchView {
    pub id: BatchId,
    pub batch_number: u32,
    pub status: BatchStatus,
    pub items: usize,
    pub result: Option<BatchResult>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Batch> for BatchView {
    fn from(batch: Batch) -> Self {
        Self {
            id: batch.id,
            batch_number: batch.batch_number,
            status: batch.status,
            items: batch.payload.len(),
            result: batch.result,
            error_message: batch.error_message,
            started_at: batch.started_at,
            completed_at: batch.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task: SyncTask,
    pub batches: Vec<BatchView>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub records: usize,
    pub queued_triggers: usize,
    pub running_tasks: usize,
    pub circuit: Option<CircuitStats>,
    pub remaining_requests: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunRequest {
    pub mode: SyncMode,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
}

impl From<RunRequest> for RunOptions {
    fn from(request: RunRequest) -> Self {
        Self {
            mode: request.mode,
            dry_run: request.dry_run,
            force: request.force,
        }
    }
}

async fn run_batch(
    State(state): State<WorkerState>,
    Path(batch_id): Path<BatchId>,
) -> Result<Json<ExecutionReport>, WorkerError> {
    tracing::debug!(%batch_id, "Batch trigger received");
    let report = state.executor.execute(batch_id).await?;
    Ok(Json(report))
}

async fn get_task(
    State(state): State<WorkerState>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<TaskView>, WorkerError> {
    let store = state.ctx.store.as_ref();
    let task = store.get_task(task_id)?.ok_or_else(|| SyncError::NotFound {
        kind: "task",
        id: task_id.to_string(),
    })?;
    let batches = store.list_batches(task_id)?.into_iter().map(BatchView::from).collect();
    Ok(Json(TaskView { task, batches }))
}

async fn health(State(state): State<WorkerState>) -> Result<Json<HealthReport>, WorkerError> {
    let ctx = &state.ctx;
    let store = ctx.store.as_ref();

    let (circuit, remaining_requests) = match store.load_resilience_state(PROTECTION_NAME)? {
        Some(saved) => {
            let circuit = saved.breaker.map(|snapshot| {
                let mut breaker =
                    CircuitBreaker::from_config(PROTECTION_NAME, &ctx.config.circuit_breaker, ctx.clock.clone());
                breaker.restore(snapshot);
                breaker.get_stats()
            });
            let remaining = saved.limiter.map(|snapshot| {
                let mut limiter = RateLimiter::new(
                    ctx.config.rate_limit.max_requests,
                    Duration::from_secs(ctx.config.rate_limit.window_secs),
                    ctx.clock.clone(),
                );
                limiter.restore(snapshot);
                limiter.get_remaining_requests()
            });
            (circuit, remaining)
        }
        None => (None, None),
    };

    let status = match &circuit {
        Some(stats) if stats.state == CircuitState::Open => "degraded",
        _ => "ok",
    };

    Ok(Json(HealthReport {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        records: store.count_records()?,
        queued_triggers: store.queue_len()?,
        running_tasks: store.list_tasks(Some(TaskStatus::Running))?.len(),
        circuit,
        remaining_requests,
    }))
}

async fn start_run(
    State(state): State<WorkerState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunOutcome>, WorkerError> {
    let Ok(_guard) = state.run_lock.try_lock() else {
        return Err(WorkerError::RunInProgress);
    };
    let outcome = state.coordinator.run(request.into()).await?;
    Ok(Json(outcome))
}

/// Build the worker router. `/health` is always open; every other route
/// sits behind the bearer-token check.
#[allow(deprecated)]
pub fn build_router(state: WorkerState) -> Router {
    let timeout = Duration::from_secs(state.ctx.config.worker.request_timeout_secs);
    let protected = Router::new()
        .route("/internal/batches/{batch_id}/run", post(run_batch))
        .route("/tasks/{task_id}", get(get_task))
        .route("/runs", post(start_run))
        .route_layer(middleware::from_fn_with_state(state.clone(), bearer_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Long-running worker: HTTP surface plus the sweep and queue loops.
pub struct WorkerServer {
    ctx: SyncContext,
    router: Router,
}

impl WorkerServer {
    pub fn new(ctx: SyncContext) -> Self {
        let router = build_router(WorkerState::new(ctx.clone()));
        Self { ctx, router }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires, then wait for the
    /// background loops to stop.
    pub async fn run(self, listener: TcpListener, shutdown: &Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            trigger = self.ctx.trigger.kind(),
            sweep_interval_secs = self.ctx.config.worker.sweep_interval_secs,
            "Worker starting"
        );

        let orchestrator = TaskOrchestrator::new(self.ctx.clone());
        let sweep_loop = tokio::spawn(orchestrator.run(shutdown.subscribe()));
        let consumer = QueueConsumer::new(self.ctx.clone());
        let queue_loop = tokio::spawn(consumer.run(shutdown.subscribe()));

        let mut server_shutdown = shutdown.subscribe();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await?;

        for handle in [sweep_loop, queue_loop] {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background loop panicked");
            }
        }

        tracing::info!("Worker stopped");
        Ok(())
    }
}
