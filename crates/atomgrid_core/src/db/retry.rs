//! Bounded retry with exponential backoff for transient store failures.
//!
//! # Invariants
//! - Only errors classified as transient are retried.
//! - The last error is returned unchanged once attempts are exhausted.

use log::warn;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub fn run<T, E>(
        &self,
        op_name: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_transient(&err) => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        "event=store_retry module=db status=warn op={op_name} attempt={attempt} backoff_ms={} error={err}",
                        backoff.as_millis()
                    );
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn retries_transient_failures_until_success() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<u32, String> = policy.run(
            "test",
            |err: &String| err == "busy",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy".to_string())
                } else {
                    Ok(7)
                }
            },
        );

        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<(), String> = policy.run(
            "test",
            |err: &String| err == "busy",
            || {
                calls.set(calls.get() + 1);
                Err("constraint".to_string())
            },
        );

        assert_eq!(result, Err("constraint".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(50));
    }
}
