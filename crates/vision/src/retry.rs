//! Bounded exponential backoff for fallible initialization and recovery.

use std::{thread, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempts: {last:#}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: anyhow::Error,
    },
}

/// How many times to try an operation and how long to wait in between.
///
/// The delay before retry `n` (1-based) is
/// `min(initial_delay * backoff_factor^(n-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    /// Component start-up: 1 s, 2 s, 4 s ... capped at 10 s.
    pub fn initialization(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Retry immediately, used by tests and synthetic hardware.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_delay: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_delay = max_delay;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(0.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub fn retry<T, F>(&self, operation: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            debug!(operation, attempt, attempts, "attempting");
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= attempts => {
                    error!(operation, attempts, "giving up: {err:#}");
                    return Err(RetryError::Exhausted {
                        operation: operation.to_owned(),
                        attempts,
                        last: err,
                    });
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed: {err:#}"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Result of [`safe_init`]: the component, or nothing plus the reason.
#[derive(Debug)]
pub struct InitOutcome<T> {
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> InitOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_parts(self) -> (Option<T>, Option<String>) {
        (self.value, self.error)
    }

    /// Replace a failed initialization with `fallback`, keeping the error text.
    pub fn or_fallback(mut self, fallback: T) -> Self {
        if self.value.is_none() {
            warn!("using fallback after failed initialization");
            self.value = Some(fallback);
        }
        self
    }
}

/// Initialize a component with retries, never failing the caller.
///
/// When every attempt fails the outcome carries no value and the last error's
/// message; the caller decides whether to run without the component.
pub fn safe_init<T, F>(component: &str, policy: &RetryPolicy, init: F) -> InitOutcome<T>
where
    F: FnMut() -> anyhow::Result<T>,
{
    info!(component, "initializing");
    match policy.retry(component, init) {
        Ok(value) => {
            info!(component, "initialized");
            InitOutcome {
                value: Some(value),
                error: None,
            }
        }
        Err(RetryError::Exhausted { last, attempts, .. }) => {
            error!(component, attempts, "initialization failed: {last:#}");
            InitOutcome {
                value: None,
                error: Some(format!("{last:#}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn delays_grow_geometrically_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));

        let init = RetryPolicy::initialization(5);
        assert_eq!(init.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(init.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let mut calls = 0;
        let value = RetryPolicy::immediate(3)
            .retry("flaky", || {
                calls += 1;
                if calls < 3 {
                    Err(anyhow!("not yet"))
                } else {
                    Ok(calls)
                }
            })
            .expect("third attempt succeeds");
        assert_eq!(value, 3);
    }

    #[test]
    fn retry_reports_last_error_when_exhausted() {
        let mut calls = 0;
        let err = RetryPolicy::immediate(2)
            .retry::<(), _>("broken", || {
                calls += 1;
                Err(anyhow!("failure {calls}"))
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        let RetryError::Exhausted {
            attempts, last, ..
        } = err;
        assert_eq!(attempts, 2);
        assert_eq!(last.to_string(), "failure 2");
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _ = RetryPolicy::immediate(0).retry::<(), _>("once", || {
            calls += 1;
            Err(anyhow!("no"))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn safe_init_returns_value_or_error_text() {
        let ok = safe_init("camera", &RetryPolicy::immediate(3), || Ok(42));
        assert!(ok.is_ok());
        assert_eq!(ok.into_parts(), (Some(42), None));

        let failed = safe_init::<u32, _>("camera", &RetryPolicy::immediate(3), || {
            Err(anyhow!("device busy"))
        });
        assert!(!failed.is_ok());
        let (value, error) = failed.into_parts();
        assert_eq!(value, None);
        assert_eq!(error.as_deref(), Some("device busy"));
    }

    #[test]
    fn fallback_replaces_missing_value_only() {
        let failed = safe_init::<u32, _>("publisher", &RetryPolicy::immediate(1), || {
            Err(anyhow!("socket"))
        })
        .or_fallback(7);
        assert_eq!(failed.value, Some(7));
        assert!(failed.error.is_some());

        let ok = safe_init("publisher", &RetryPolicy::immediate(1), || Ok(1)).or_fallback(7);
        assert_eq!(ok.value, Some(1));
    }
}
