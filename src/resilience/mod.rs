//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound API call:
//!     → rate_limiter.rs (block until the rolling window has room)
//!     → circuit_breaker.rs (fail fast while the upstream is down)
//!     → On retryable failure: retries.rs + backoff.rs (wait, try again)
//! ```
//!
//! # Design Decisions
//! - Every outbound call has a deadline (connect + read timeouts on the client)
//! - Only 429/5xx and transport errors are retried
//! - Limiter and breaker state is persisted so protection spans invocations

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retries;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitError, CircuitState, CircuitStats};
pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use retries::RetryPolicy;
