//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → every subscribed loop exits its select → server drains → exit
//! ```
//!
//! # Design Decisions
//! - Background loops subscribe before they are spawned, so a trigger is
//!   never missed
//! - A second signal is not special-cased; in-flight batches are left to the
//!   stale-batch recovery of the next sweep

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
