//! Retry backoff: exponential in the attempt number with uniform jitter,
//! capped at a configurable ceiling.

use std::time::Duration;

use rand::Rng;

/// Deterministic part of the delay for the given attempt (1-based).
/// `base * 2^(attempt-1)`, capped at `max_delay`.
pub fn retry_delay_deterministic(attempt: i32, base: Duration, max_delay: Duration) -> Duration {
    let attempt = attempt.max(1) as u32;
    let factor = 2u64.saturating_pow(attempt - 1);
    let delay = base.saturating_mul(factor as u32);
    delay.min(max_delay)
}

/// Full delay: deterministic part plus `uniform(0, base)` jitter to
/// spread synchronized retries.
pub fn retry_delay(attempt: i32, base: Duration, max_delay: Duration) -> Duration {
    let deterministic = retry_delay_deterministic(attempt, base, max_delay);
    let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64);
    deterministic + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(10);
    const CAP: Duration = Duration::from_secs(600);

    #[test]
    fn first_attempt_waits_one_base() {
        assert_eq!(retry_delay_deterministic(1, BASE, CAP), BASE);
    }

    #[test]
    fn doubles_per_attempt_until_cap() {
        assert_eq!(
            retry_delay_deterministic(2, BASE, CAP),
            Duration::from_secs(20)
        );
        assert_eq!(
            retry_delay_deterministic(3, BASE, CAP),
            Duration::from_secs(40)
        );
        assert_eq!(retry_delay_deterministic(10, BASE, CAP), CAP);
        assert_eq!(retry_delay_deterministic(30, BASE, CAP), CAP);
    }

    #[test]
    fn monotone_before_jitter() {
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = retry_delay_deterministic(attempt, BASE, CAP);
            assert!(delay >= last, "attempt {} regressed", attempt);
            last = delay;
        }
    }

    #[test]
    fn jitter_stays_within_one_base() {
        for attempt in 1..=5 {
            let deterministic = retry_delay_deterministic(attempt, BASE, CAP);
            for _ in 0..50 {
                let total = retry_delay(attempt, BASE, CAP);
                assert!(total >= deterministic);
                assert!(total <= deterministic + BASE);
            }
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(retry_delay_deterministic(i32::MAX, BASE, CAP), CAP);
    }
}
