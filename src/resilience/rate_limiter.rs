//! Rolling-window rate limiter for outbound API calls.
//!
//! At most `max_requests` calls are recorded in any trailing window of
//! length `window`. When the window is full the caller is blocked until the
//! oldest call ages out, then the history is discarded and a fresh window
//! starts with the current call.
//!
//! One instance serializes one caller's traffic; it is not internally
//! synchronized.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{elapsed_between, Clock};
use crate::observability::metrics;

/// Added to every forced wait so the oldest call is safely outside the window.
const WAIT_EPSILON: Duration = Duration::from_millis(100);

/// Persistable limiter state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimiterSnapshot {
    pub requests: Vec<DateTime<Utc>>,
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: VecDeque<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            requests: VecDeque::new(),
            clock,
        }
    }

    /// Record a call, blocking first if the window is full.
    ///
    /// Returns the time spent waiting.
    pub async fn wait_if_needed(&mut self) -> Duration {
        let now = self.clock.now();
        self.prune(now);

        let mut waited = Duration::ZERO;
        if self.requests.len() >= self.max_requests {
            if let Some(&oldest) = self.requests.front() {
                let age = elapsed_between(oldest, now);
                waited = self.window.saturating_sub(age) + WAIT_EPSILON;
                tracing::info!(
                    wait_ms = waited.as_millis() as u64,
                    recorded = self.requests.len(),
                    max_requests = self.max_requests,
                    "Rate limit reached, waiting for window to reset"
                );
                metrics::record_rate_limit_wait(waited);
                self.clock.sleep(waited).await;
            }
            self.requests.clear();
        }

        self.requests.push_back(self.clock.now());
        waited
    }

    /// Calls still available in the current window.
    pub fn get_remaining_requests(&self) -> usize {
        let recorded = self.live_requests(self.clock.now()).count();
        self.max_requests.saturating_sub(recorded)
    }

    /// When the oldest live call leaves the window, if any call is recorded.
    pub fn get_reset_time(&self) -> Option<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.window).ok()?;
        self.live_requests(self.clock.now())
            .next()
            .map(|oldest| oldest + window)
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Calls recorded within the trailing window.
    pub fn recorded(&self) -> usize {
        self.live_requests(self.clock.now()).count()
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            requests: self.requests.iter().copied().collect(),
        }
    }

    /// Adopt history persisted by a previous invocation.
    pub fn restore(&mut self, snapshot: RateLimiterSnapshot) {
        self.requests = snapshot.requests.into_iter().collect();
        self.requests.make_contiguous().sort();
        self.prune(self.clock.now());
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(&oldest) = self.requests.front() {
            if elapsed_between(oldest, now) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn live_requests(&self, now: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let window = self.window;
        self.requests
            .iter()
            .copied()
            .filter(move |ts| elapsed_between(*ts, now) < window)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("recorded", &self.requests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: usize, window_secs: u64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = RateLimiter::new(max, Duration::from_secs(window_secs), Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_records_without_waiting_under_limit() {
        let (mut limiter, _clock) = limiter(3, 60);
        for _ in 0..3 {
            assert_eq!(limiter.wait_if_needed().await, Duration::ZERO);
        }
        assert_eq!(limiter.get_remaining_requests(), 0);
    }

    #[tokio::test]
    async fn test_full_window_forces_wait_and_resets_history() {
        let (mut limiter, clock) = limiter(2, 60);
        limiter.wait_if_needed().await;
        clock.advance(Duration::from_secs(20));
        limiter.wait_if_needed().await;

        let waited = limiter.wait_if_needed().await;
        assert_eq!(waited, Duration::from_secs(40) + WAIT_EPSILON);
        // history discarded, only the current call remains
        assert_eq!(limiter.recorded(), 1);
        assert_eq!(limiter.get_remaining_requests(), 1);
    }

    #[tokio::test]
    async fn test_window_never_exceeds_max() {
        let (mut limiter, clock) = limiter(5, 10);
        for i in 0..40 {
            limiter.wait_if_needed().await;
            assert!(limiter.recorded() <= 5, "iteration {i} exceeded window");
            clock.advance(Duration::from_millis(700));
        }
    }

    #[tokio::test]
    async fn test_old_calls_are_pruned() {
        let (mut limiter, clock) = limiter(2, 10);
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;
        clock.advance(Duration::from_secs(11));
        assert_eq!(limiter.get_remaining_requests(), 2);
        assert_eq!(limiter.wait_if_needed().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_reset_time_tracks_oldest_call() {
        let (mut limiter, clock) = limiter(5, 60);
        assert!(limiter.get_reset_time().is_none());
        let first = clock.now();
        limiter.wait_if_needed().await;
        clock.advance(Duration::from_secs(5));
        limiter.wait_if_needed().await;
        assert_eq!(limiter.get_reset_time(), Some(first + chrono::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_snapshot_restore_preserves_protection() {
        let (mut limiter, clock) = limiter(2, 60);
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;

        let mut cold_start = RateLimiter::new(2, Duration::from_secs(60), Arc::new(clock.clone()));
        cold_start.restore(limiter.snapshot());
        assert_eq!(cold_start.get_remaining_requests(), 0);
        assert!(cold_start.wait_if_needed().await > Duration::ZERO);
    }
}
