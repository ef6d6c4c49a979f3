//! Bounded retry with exponential backoff for transient network failures.
//!
//! Registry lookups, pull request status checks, and git fetch/push are the
//! calls most likely to hit a flaky network in CI. Each is wrapped in
//! [`with_backoff`], which retries only errors the caller classifies as
//! transient and gives up after a fixed number of attempts.

use std::fmt::Display;
use std::time::Duration;

/// Default number of attempts (including the first one).
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Maximum backoff duration in seconds
pub const MAX_BACKOFF_SECS: u64 = 8;

/// Calculate exponential backoff duration for a given attempt number
///
/// Attempt 1: 0 seconds (immediate)
/// Attempt 2: 1 second
/// Attempt 3: 2 seconds
/// Attempt 4: 4 seconds
/// Attempt 5+: 8 seconds (max)
pub fn calculate_backoff(attempt: u32) -> Duration {
    if attempt <= 1 {
        Duration::from_secs(0)
    } else {
        let exponent = attempt.saturating_sub(2);
        // Cap the exponent to avoid overflow
        let secs = if exponent >= 63 {
            MAX_BACKOFF_SECS
        } else {
            2u64.pow(exponent).min(MAX_BACKOFF_SECS)
        };
        Duration::from_secs(secs)
    }
}

/// How many times to try, and the ceiling on the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Upper bound applied to [`calculate_backoff`].
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }

    /// A policy that retries without sleeping. Used by tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

/// Run `op`, retrying while it fails with an error `is_transient` accepts.
///
/// The last error is returned unchanged once the attempts are exhausted or a
/// non-transient error occurs.
pub fn with_backoff<T, E, F, P>(
    policy: &RetryPolicy,
    what: &str,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = policy.delay(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_transient(&e) => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    attempts,
                    e,
                    policy.delay(attempt + 1)
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_backoff_attempt_1_immediate() {
        assert_eq!(calculate_backoff(1), Duration::from_secs(0));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(calculate_backoff(2), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3), Duration::from_secs(2));
        assert_eq!(calculate_backoff(4), Duration::from_secs(4));
        assert_eq!(calculate_backoff(5), Duration::from_secs(8));
        assert_eq!(calculate_backoff(100), Duration::from_secs(8));
    }

    #[test]
    fn test_policy_delay_respects_ceiling() {
        let policy = RetryPolicy::immediate(5);
        assert_eq!(policy.delay(4), Duration::ZERO);
    }

    #[test]
    fn test_retries_transient_until_success() {
        let calls = Cell::new(0);
        let result: Result<u32, String> =
            with_backoff(&RetryPolicy::immediate(3), "op", |_| true, || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("flaky".to_string())
                } else {
                    Ok(7)
                }
            });

        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), String> =
            with_backoff(&RetryPolicy::immediate(2), "op", |_| true, || {
                calls.set(calls.get() + 1);
                Err("down".to_string())
            });

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), String> =
            with_backoff(&RetryPolicy::immediate(5), "op", |_| false, || {
                calls.set(calls.get() + 1);
                Err("rejected".to_string())
            });

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let calls = Cell::new(0);
        let _: Result<(), String> = with_backoff(&RetryPolicy::immediate(0), "op", |_| true, || {
            calls.set(calls.get() + 1);
            Err("x".to_string())
        });
        assert_eq!(calls.get(), 1);
    }
}
