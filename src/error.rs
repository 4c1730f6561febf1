//! Run-level error taxonomy.
//!
//! Layer errors (`ApiError`, `StoreError`, `ConfigError`) live next to the
//! layer that raises them and convert into [`SyncError`] at the boundary.
//! Rate-limit waits are delays, never errors.

use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::store::StoreError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream call failed after retries were exhausted.
    #[error("upstream error: {0}")]
    Upstream(ApiError),

    /// Outbound calls are short-circuited; not retried internally.
    #[error("circuit '{name}' is open, next attempt in {}s", remaining.as_secs())]
    CircuitOpen { name: String, remaining: Duration },

    /// Pre-flight store checks failed; nothing was mutated.
    #[error("sanity check failed: {}", .0.join("; "))]
    SanityCheck(Vec<String>),

    /// Post-update validation reported hard issues.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("trigger error: {0}")]
    Trigger(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::CircuitOpen { name, remaining } => SyncError::CircuitOpen { name, remaining },
            other => SyncError::Upstream(other),
        }
    }
}

impl SyncError {
    /// Errors raised before any mutation never need a rollback.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(self, SyncError::SanityCheck(_) | SyncError::Config(_))
    }
}
