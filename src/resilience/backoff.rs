//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Returns the next sleep while waiting for a free connection.
///
/// The first sleep is 10ms plus up to 40ms of jitter; each later one doubles
/// the previous. The result never exceeds `remaining`.
pub fn next_backoff(prev: Duration, remaining: Duration) -> Duration {
    let sleep = if prev.is_zero() {
        Duration::from_millis(10 + rand::thread_rng().gen_range(0..40))
    } else {
        prev.saturating_mul(2)
    };
    sleep.min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sleep_is_jittered() {
        for _ in 0..100 {
            let first = next_backoff(Duration::ZERO, Duration::from_secs(1));
            assert!(first >= Duration::from_millis(10));
            assert!(first < Duration::from_millis(50));
        }
    }

    #[test]
    fn sleeps_double_until_clipped() {
        let mut remaining = Duration::from_millis(1000);
        let mut prev = Duration::ZERO;
        let mut total = Duration::ZERO;
        while !remaining.is_zero() {
            let next = next_backoff(prev, remaining);
            assert!(next <= remaining);
            if next < remaining {
                assert!(next >= prev);
            }
            total += next;
            remaining -= next;
            prev = next;
        }
        assert_eq!(total, Duration::from_millis(1000));
    }

    #[test]
    fn zero_remaining_means_no_sleep() {
        assert_eq!(next_backoff(Duration::from_millis(80), Duration::ZERO), Duration::ZERO);
    }
}
