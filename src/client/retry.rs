//! Bounded exponential backoff for transient transport failures.

use rand::Rng;
use std::time::Duration;

pub(crate) const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

// Beyond this the uncapped delay would overflow; the cap has long since won.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    initial: Duration,
    cap: Duration,
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            cap: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The deterministic part of the delay: `initial * 2^attempt`, capped.
    pub(crate) fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.initial.saturating_mul(factor).min(self.cap)
    }

    /// Delay before the given retry attempt (0-based), with jitter of up to
    /// one initial delay to spread out competing callers.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.initial.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_ms))
        };
        self.base_delay(attempt).saturating_add(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, Duration::from_millis(200))]
    #[case(1, Duration::from_millis(400))]
    #[case(2, Duration::from_millis(800))]
    #[case(3, Duration::from_millis(1600))]
    #[case(4, Duration::from_millis(3200))]
    #[case(5, Duration::from_secs(5))]
    #[case(30, Duration::from_secs(5))]
    #[case(u32::MAX, Duration::from_secs(5))]
    fn base_delay_doubles_up_to_the_cap(#[case] attempt: u32, #[case] expected: Duration) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(attempt), expected);
    }

    #[test]
    fn delay_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt);
            assert!(delay >= base);
            assert!(delay < base + DEFAULT_INITIAL_DELAY);
        }
    }

    #[test]
    fn default_retry_budget() {
        assert_eq!(RetryPolicy::default().max_retries(), 3);
    }
}
