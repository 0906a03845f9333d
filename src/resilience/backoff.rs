//! Exponential backoff with jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Maps a 1-based retry attempt to the delay before that retry.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Calculate exponential backoff delay with jitter.
///
/// Jitter of up to 10% is added on top of the capped delay, so only the
/// un-jittered floor is monotonic in `attempt`; consecutive delays at the cap
/// may decrease.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Backoff policy for the configured base and cap.
pub fn backoff_fn(config: &BackoffConfig) -> BackoffFn {
    let (base_ms, max_ms) = (config.base_delay_ms, config.max_delay_ms);
    Arc::new(move |attempt: u32| calculate_backoff(attempt, base_ms, max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);

        assert_eq!(calculate_backoff(0, 100, 1000), Duration::ZERO);
    }

    #[test]
    fn test_delay_never_below_previous_floor() {
        for attempt in 1..40u32 {
            let floor = Duration::from_millis((5u64 << (attempt - 1).min(20)).min(1000));
            assert!(calculate_backoff(attempt, 5, 1000) >= floor, "attempt {attempt}");
            assert!(calculate_backoff(attempt + 1, 5, 1000) >= floor, "attempt {attempt}");
        }
    }

    #[test]
    fn test_jitter_stays_within_tenth_above_cap() {
        for _ in 0..100 {
            let delay = calculate_backoff(20, 100, 1000);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_backoff_fn_uses_config() {
        let f = backoff_fn(&BackoffConfig {
            base_delay_ms: 10,
            max_delay_ms: 40,
        });
        assert_eq!(f(1), Duration::from_millis(10));
        assert!(f(3) >= Duration::from_millis(40));
        assert!(f(30) < Duration::from_millis(44));
    }
}
