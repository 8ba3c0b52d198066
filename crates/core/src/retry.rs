//! Exponential-backoff retry engine.
//!
//! Every object-storage call runs through a [`Retrier`]. The retry decision is made on an
//! explicit classification ([`Retryable`]) produced by the caller's error type, never by
//! inspecting error text.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::storage_default()
    }
}

impl RetryPolicy {
    pub fn storage_default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_base: 2.0,
            jitter: true,
        }
    }

    pub fn download_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_base: 2.0,
            jitter: false,
        }
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::storage_default()
        }
    }

    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Upper bound of the sleep that follows failed attempt `attempt` (1-based):
    /// `min(max_delay, base_delay * backoff_base^(attempt - 1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw_ms = self.base_delay_ms as f64 * self.backoff_base.powi(exponent);
        let max_ms = self.max_delay_ms as f64;

        let capped_ms = if raw_ms.is_finite() && raw_ms >= 0.0 {
            raw_ms.min(max_ms)
        } else {
            max_ms
        };

        Duration::from_millis(capped_ms as u64)
    }

    /// The sleep actually taken after failed attempt `attempt`. With jitter enabled this is
    /// drawn uniformly from `[0, delay_for_attempt(attempt)]`.
    pub fn sleep_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.delay_for_attempt(attempt);
        if !self.jitter {
            return ceiling;
        }

        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

/// Errors that know whether the failed call is safe to repeat.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or the policy's
    /// attempts are used up. The last error is returned exactly as `call` produced it.
    pub fn run<T, E, F>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Retryable + Display,
    {
        let max_attempts = self.policy.effective_max_attempts();
        let mut rng = rand::thread_rng();
        let mut attempt = 1;

        loop {
            match call() {
                Ok(value) => {
                    info!(
                        operation,
                        attempt, max_attempts, outcome = "success", "call attempt finished"
                    );
                    return Ok(value);
                }
                Err(error) => {
                    let retryable = error.is_retryable();
                    info!(
                        operation,
                        attempt,
                        max_attempts,
                        outcome = "failure",
                        retryable,
                        error = %error,
                        "call attempt finished"
                    );

                    if !retryable || attempt >= max_attempts {
                        return Err(error);
                    }

                    let delay = self.policy.sleep_for_attempt(attempt, &mut rng);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient error"
                    );
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    struct FakeError {
        code: &'static str,
        retryable: bool,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake error {}", self.code)
        }
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn quick_policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_base: 2.0,
            jitter,
        }
    }

    #[test]
    fn retryable_error_uses_every_attempt_then_returns_last_error() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrier = Retrier::with_sleeper(quick_policy(4, false), sleeper.clone());
        let calls = Cell::new(0u32);

        let result: Result<(), FakeError> = retrier.run("put", || {
            calls.set(calls.get() + 1);
            Err(FakeError {
                code: if calls.get() == 4 { "SlowDown" } else { "Throttling" },
                retryable: true,
            })
        });

        assert_eq!(calls.get(), 4);
        assert_eq!(
            result.expect_err("exhausted retries should fail"),
            FakeError {
                code: "SlowDown",
                retryable: true
            }
        );
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn non_retryable_error_is_returned_after_one_attempt() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrier = Retrier::with_sleeper(quick_policy(4, true), sleeper.clone());
        let calls = Cell::new(0u32);

        let result: Result<(), FakeError> = retrier.run("head", || {
            calls.set(calls.get() + 1);
            Err(FakeError {
                code: "NoSuchKey",
                retryable: false,
            })
        });

        assert_eq!(calls.get(), 1);
        assert!(result.is_err());
        assert!(sleeper.delays().is_empty());
    }

    #[test]
    fn success_after_transient_failures_returns_value() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let retrier = Retrier::with_sleeper(quick_policy(4, false), sleeper.clone());
        let calls = Cell::new(0u32);

        let result = retrier.run("copy", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(FakeError {
                    code: "InternalError",
                    retryable: true,
                })
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result, Ok(3));
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[test]
    fn zero_max_attempts_still_calls_once() {
        let retrier = Retrier::with_sleeper(quick_policy(0, false), Arc::new(RecordingSleeper::new()));
        let calls = Cell::new(0u32);

        let _: Result<(), FakeError> = retrier.run("list", || {
            calls.set(calls.get() + 1);
            Err(FakeError {
                code: "SlowDown",
                retryable: true,
            })
        });

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = quick_policy(10, false);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_millis(1_000));
    }

    #[test]
    fn jittered_sleep_stays_within_computed_delay() {
        let policy = quick_policy(10, true);
        let mut rng = rand::thread_rng();

        for attempt in 1..=12 {
            let ceiling = policy.delay_for_attempt(attempt);
            assert!(ceiling <= Duration::from_millis(policy.max_delay_ms));
            for _ in 0..50 {
                let sleep = policy.sleep_for_attempt(attempt, &mut rng);
                assert!(sleep <= ceiling, "attempt {attempt}: {sleep:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn storage_default_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
        assert!(policy.jitter);
    }
}
