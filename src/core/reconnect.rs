use std::time::Duration;

use super::types::ReconnectStrategy;

/// Capped exponential backoff with a bounded number of attempts.
///
/// The n-th scheduled retry (n starting at 0) waits `min(base * 2^n, max)`.
/// Once `max_attempts` retries have been handed out, `should_retry` turns
/// false until `reset` is called.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffReconnect {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoffReconnect {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay for a given attempt index without touching the counter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }
}

impl Default for ExponentialBackoffReconnect {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000), 10)
    }
}

impl ReconnectStrategy for ExponentialBackoffReconnect {
    fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let mut backoff = ExponentialBackoffReconnect::default();
        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn delay_matches_formula_for_every_attempt() {
        let backoff = ExponentialBackoffReconnect::default();
        for n in 0..40u32 {
            let expected = if n >= 5 {
                30_000
            } else {
                (1000u64 * 2u64.pow(n)).min(30_000)
            };
            assert_eq!(backoff.delay_for(n).as_millis() as u64, expected, "attempt {n}");
        }
    }

    #[test]
    fn retries_stop_at_cap_and_resume_after_reset() {
        let mut backoff = ExponentialBackoffReconnect::default();
        for _ in 0..10 {
            assert!(backoff.should_retry());
            backoff.next_delay();
        }
        assert!(!backoff.should_retry());
        assert_eq!(backoff.attempts(), 10);

        backoff.reset();
        assert!(backoff.should_retry());
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }
}
