//! Circuit breaker for upstream API protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: upstream assumed down, calls fail fast
//! - Half-Open: probation, calls pass through and are counted
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: lazily, on next access once recovery_timeout has elapsed
//! Half-Open → Closed: consecutive successes >= success_threshold
//! Half-Open → Open: any single failure
//! ```
//!
//! # Design Decisions
//! - The breaker never retries; retrying is the caller's policy
//! - Not internally synchronized; callers serialize access to one instance
//! - State is snapshotted so protection survives process restarts

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{elapsed_between, Clock};
use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit '{name}' is open, retry in {:.1}s", remaining.as_secs_f64())]
    Open { name: String, remaining: Duration },

    #[error(transparent)]
    Inner(E),
}

/// Persistable breaker state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

/// Point-in-time view for status endpoints and logs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
    pub failure_rate_pct: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub seconds_until_recovery: Option<f64>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<DateTime<Utc>>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_time: None,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            times_opened: 0,
            clock,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_secs),
            config.success_threshold,
            clock,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the lazy Open → Half-Open transition.
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open && self.recovery_remaining().is_zero() {
            self.transition(CircuitState::HalfOpen);
        }
        self.state
    }

    /// Run `f` under the breaker.
    ///
    /// Fails fast with [`CircuitError::Open`] while open; otherwise runs the
    /// call, updates counters from its outcome and hands the error back.
    pub async fn call<F, Fut, T, E>(&mut self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.state() == CircuitState::Open {
            let remaining = self.recovery_remaining();
            tracing::debug!(breaker = %self.name, remaining_ms = remaining.as_millis() as u64, "Circuit open, failing fast");
            return Err(CircuitError::Open {
                name: self.name.clone(),
                remaining,
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.total_successes += 1;
        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                self.consecutive_failures = 0;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.last_failure_time = Some(self.clock.now());
        match self.state {
            CircuitState::HalfOpen => self.transition(CircuitState::Open),
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                if self.consecutive_failures >= self.failure_threshold {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed.
    pub fn reset(&mut self) {
        self.transition(CircuitState::Closed);
        self.last_failure_time = None;
    }

    pub fn get_stats(&mut self) -> CircuitStats {
        let state = self.state();
        let failure_rate_pct = if self.total_calls == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_calls as f64 * 100.0
        };
        let seconds_until_recovery =
            (state == CircuitState::Open).then(|| self.recovery_remaining().as_secs_f64());

        CircuitStats {
            name: self.name.clone(),
            state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            times_opened: self.times_opened,
            failure_rate_pct,
            last_failure_time: self.last_failure_time,
            seconds_until_recovery,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_failure_time: self.last_failure_time,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            times_opened: self.times_opened,
        }
    }

    pub fn restore(&mut self, snapshot: BreakerSnapshot) {
        self.state = snapshot.state;
        self.consecutive_failures = snapshot.consecutive_failures;
        self.consecutive_successes = snapshot.consecutive_successes;
        self.last_failure_time = snapshot.last_failure_time;
        self.total_calls = snapshot.total_calls;
        self.total_failures = snapshot.total_failures;
        self.total_successes = snapshot.total_successes;
        self.times_opened = snapshot.times_opened;
    }

    fn recovery_remaining(&self) -> Duration {
        match self.last_failure_time {
            Some(failed_at) => {
                let elapsed = elapsed_between(failed_at, self.clock.now());
                self.recovery_timeout.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        let previous = self.state;
        self.state = next;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        if next == CircuitState::Open {
            self.times_opened += 1;
            tracing::warn!(
                breaker = %self.name,
                from = %previous,
                recovery_timeout_secs = self.recovery_timeout.as_secs(),
                "Circuit opened"
            );
        } else {
            tracing::info!(breaker = %self.name, from = %previous, to = %next, "Circuit state changed");
        }
        metrics::record_circuit_state(&self.name, next);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("consecutive_successes", &self.consecutive_successes)
            .finish()
    }
}
