//! Change detection subsystem.
//!
//! # Data Flow
//! ```text
//! RecordSource (fetch window, fetch detail)
//!     → planner.rs (filter by last-modified, match by natural key)
//!     → SyncPlan { additions, updates }
//!     → UpdateCoordinator
//! ```

pub mod planner;

pub use planner::{classify, PlanSummary, SyncPlan, SyncPlanner};
