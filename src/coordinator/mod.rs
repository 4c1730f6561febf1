//! Run coordination subsystem.
//!
//! # Data Flow
//! ```text
//! RunOptions
//!     → sanity.rs (pre-flight; any failure aborts before mutation)
//!     → SyncPlanner (plan additions / updates)
//!     → dry run? report and stop
//!     → backup.rs (whole-store snapshot)
//!     → apply directly, or create a batched task
//!     → finalize.rs (associations → validation → rollback or metrics row)
//! ```
//!
//! # Design Decisions
//! - Batched runs finalize through the same path as direct runs, from
//!   whichever executor resolves the last batch
//! - A failed backup degrades the run instead of aborting it
//! - Every mutating run, successful or not, writes exactly one metrics row

pub mod backup;
pub mod finalize;
pub mod metrics;
pub mod sanity;
pub mod update;

pub use backup::{Backup, BackupManager};
pub use finalize::RunFinalizer;
pub use metrics::UpdateMetrics;
pub use sanity::run_sanity_checks;
pub use update::{RunOptions, RunOutcome, UpdateCoordinator};
