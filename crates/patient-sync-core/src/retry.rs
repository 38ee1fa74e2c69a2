//! Bounded retry with exponential backoff and jitter.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Retry behaviour for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling for the exponential delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Extra random delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::lock_conflict()
    }
}

impl RetryPolicy {
    /// Policy for lock and deadlock errors on the change table: 3 attempts from 1s.
    pub fn lock_conflict() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.5,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Delay after a failed attempt (1-indexed), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        // powi overflows to inf long before attempts run out
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(1.0 + extra)
    }

    /// Run `op`, retrying while `retryable` accepts the error.
    ///
    /// Returns the last error once attempts are exhausted or the error is not
    /// retryable.
    pub fn run<T, E, F, R>(&self, operation: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if retryable(&e) && attempt < max_attempts => {
                    let delay = self.jittered(self.delay_for_attempt(attempt));
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    thread::sleep(delay);
                }
                Err(e) => {
                    if retryable(&e) {
                        warn!(operation, attempt, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::lock_conflict();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let policy = RetryPolicy::lock_conflict();
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_stops_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> = RetryPolicy::testing().run(
            "test",
            |_| {
                calls.set(calls.get() + 1);
                Err("deadlock".to_string())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let calls = Cell::new(0);
        let result: Result<(), String> = RetryPolicy::testing().run(
            "test",
            |_| {
                calls.set(calls.get() + 1);
                Err("syntax".to_string())
            },
            |_| false,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_recovers_on_later_attempt() {
        let result: Result<u32, String> = RetryPolicy::testing().run(
            "test",
            |attempt| if attempt < 2 { Err("busy".into()) } else { Ok(attempt) },
            |_| true,
        );
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn test_jitter_never_shortens_delay() {
        let policy = RetryPolicy::lock_conflict();
        let base = Duration::from_secs(1);
        for _ in 0..20 {
            let d = policy.jittered(base);
            assert!(d >= base && d <= base.mul_f64(1.5));
        }
    }
}
