//! Upstream API subsystem.
//!
//! # Data Flow
//! ```text
//! SyncPlanner
//!     → RecordSource::fetch_window / fetch_detail
//!     → client.rs (ApiClient)
//!         → RateLimiter::wait_if_needed
//!         → CircuitBreaker::call
//!         → reqwest GET (connect + read timeouts)
//!         → retry on 429 / 5xx / transport error with backoff
//!     → types.rs (explicit wire schemas)
//! ```
//!
//! # Design Decisions
//! - The planner depends on the `RecordSource` trait, not on HTTP
//! - Limiter and breaker state is loaded from and saved to the store so
//!   protection spans independent invocations
//! - An open circuit is surfaced to the caller and never retried here

pub mod client;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use client::ApiClient;
pub use types::{FetchWindow, RecordPage, UpstreamDocument, UpstreamRecord, UpstreamWitness};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("circuit '{name}' is open, next attempt in {}s", remaining.as_secs())]
    CircuitOpen { name: String, remaining: Duration },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request URL: {0}")]
    Url(String),
}

impl ApiError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(e) => crate::resilience::retries::is_retryable_error(e),
            ApiError::Status { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(crate::resilience::retries::is_retryable_status)
                .unwrap_or(false),
            ApiError::CircuitOpen { .. } | ApiError::Decode(_) | ApiError::Url(_) => false,
        }
    }
}

/// Where candidate records come from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Every record whose date falls in `window`, following pagination.
    async fn fetch_window(&self, window: &FetchWindow) -> Result<Vec<UpstreamRecord>, ApiError>;

    /// Full detail (witnesses, documents) for one record.
    async fn fetch_detail(&self, external_id: &str) -> Result<UpstreamRecord, ApiError>;

    /// Outbound requests issued so far by this source.
    fn requests_made(&self) -> u64;
}
