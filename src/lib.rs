//! Resilient incremental record synchronization.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                     RECORD SYNC                       │
//!                  │                                                       │
//!   record-sync    │  ┌─────────────┐   ┌─────────────┐   ┌────────────┐  │
//!   run ───────────┼─▶│ coordinator │──▶│    sync     │──▶│    api     │──┼──▶ Upstream
//!                  │  │  (sanity,   │   │  (planner)  │   │ (limiter + │  │     API
//!                  │  │   backup)   │   └─────────────┘   │  breaker)  │  │
//!                  │  └──────┬──────┘                     └────────────┘  │
//!                  │         │ small plan: apply directly                  │
//!                  │         │ large plan: task + batches                  │
//!                  │         ▼                                             │
//!   worker ────────┼─▶┌─────────────┐   ┌─────────────┐   ┌────────────┐  │
//!   POST /internal │  │    batch    │──▶│    store    │◀──│ validation │  │
//!   /batches/..    │  │ (executor,  │   │  (SQLite)   │   └────────────┘  │
//!                  │  │  sweep)     │   └─────────────┘                   │
//!                  │  └─────────────┘                                     │
//!                  │                                                       │
//!                  │  ┌─────────────────────────────────────────────────┐ │
//!                  │  │            Cross-Cutting Concerns                │ │
//!                  │  │  config · observability · resilience · notify   │ │
//!                  │  │  clock · lifecycle                               │ │
//!                  │  └─────────────────────────────────────────────────┘ │
//!                  └──────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod api;
pub mod batch;
pub mod coordinator;
pub mod store;
pub mod sync;

// Process surface
pub mod context;
pub mod worker;

// Cross-cutting concerns
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod observability;
pub mod resilience;
pub mod validation;

pub use config::schema::SyncConfig;
pub use context::SyncContext;
pub use coordinator::{RunOptions, RunOutcome, UpdateCoordinator};
pub use error::{SyncError, SyncResult};
pub use lifecycle::Shutdown;
pub use worker::WorkerServer;
