//! Worker process surface.
//!
//! # Data Flow
//! ```text
//! POST /internal/batches/{id}/run ──▶ BatchExecutor::execute ──▶ ExecutionReport
//! GET  /tasks/{id}                ──▶ task row + batch rows (no payloads)
//! GET  /health                    ──▶ store counts + persisted breaker/limiter state
//! POST /runs                      ──▶ UpdateCoordinator::run (one at a time)
//!
//! background:
//!     TaskOrchestrator::run  (sweep every sweep_interval_secs)
//!     QueueConsumer::run     (drain every queue_poll_interval_ms)
//! ```
//!
//! # Design Decisions
//! - The worker holds no state of its own; every handler reads the store
//! - `/health` stays open even when a bearer token is configured

pub mod auth;
pub mod server;

pub use server::{build_router, WorkerServer, WorkerState};
