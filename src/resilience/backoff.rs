//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped at
/// `max_ms`, plus up to 10% jitter. Attempt 0 never waits.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let first = calculate_backoff(1, 100, 10_000);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(110));

        let third = calculate_backoff(3, 100, 10_000);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(440));
    }

    #[test]
    fn test_backoff_is_capped() {
        let capped = calculate_backoff(20, 100, 1_000);
        assert!(capped >= Duration::from_millis(1_000) && capped < Duration::from_millis(1_100));
    }

    #[test]
    fn test_attempt_zero_does_not_wait() {
        assert_eq!(calculate_backoff(0, 100, 1_000), Duration::ZERO);
    }
}
