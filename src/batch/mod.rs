//! Batch-chain subsystem.
//!
//! # Data Flow
//! ```text
//! UpdateCoordinator (large or full plan)
//!     → planner.rs (divide_into_batches, plan_batches) → Batch rows
//!     → trigger.rs (first batch)
//!
//! Worker invocation:
//!     → queue.rs (durable signal) or POST /internal/batches/{id}/run
//!     → executor.rs (claim, validate, apply under checkpoint.rs)
//!     → apply.rs (per-item mutations, tracked)
//!     → trigger.rs (next pending batch)
//!
//! Backstop:
//!     → orchestrator.rs (periodic sweep: requeue stalled, trigger pending)
//! ```
//!
//! # Design Decisions
//! - Failure isolation is per batch: a failed batch is rolled back alone and
//!   never blocks the batches after it
//! - Aggregate counts are recomputed from batch rows, never incremented
//! - No long-lived coordinator is required; a worker process just makes the
//!   chain faster

pub mod apply;
pub mod checkpoint;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod trigger;
pub mod types;

pub use checkpoint::{rollback_checkpoint, Checkpoint};
pub use executor::{BatchExecutor, ExecutionReport};
pub use orchestrator::{SweepReport, TaskOrchestrator};
pub use planner::{divide_into_batches, validate_batch};
pub use queue::QueueConsumer;
pub use trigger::{BatchTrigger, HttpTrigger, QueueTrigger, TriggerOutcome};
pub use types::WorkItem;
