//! Retry policy implementation.

use async_trait::async_trait;
use graphvec_core::Classify;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy configuration.
///
/// Decisions are pure: [`RetryPolicy::should_retry`] depends only on the
/// error kind and the attempt count, and [`RetryPolicy::backoff`] only on
/// the attempt count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to randomise delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with the specified max attempts.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Creates a policy that never gives up on a retryable error.
    #[must_use]
    pub fn unbounded(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Sets the delay bounds.
    #[must_use]
    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns true if an operation that failed with `error` on attempt
    /// `attempt` should be tried again.
    ///
    /// Terminal kinds are never retried, whatever the attempt count.
    pub fn should_retry<E: Classify + ?Sized>(&self, error: &E, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Calculates the un-jittered delay after the given attempt:
    /// `min(initial * multiplier^(attempt - 1), max)`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let cap_ms = self.max_delay.as_millis() as f64;
        let raw_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        Duration::from_millis(raw_ms.min(cap_ms) as u64)
    }

    /// Calculates the delay to wait after the given attempt, applying jitter
    /// when enabled. Jittered delays are drawn uniformly from `[d/2, d]`.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let full = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(full / 2..=full))
    }

    /// Executes a function with retry logic, sleeping on the tokio timer.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute_with_sleep(&TokioSleep, f).await
    }

    /// Executes a function with retry logic using the given sleeper.
    pub async fn execute_with_sleep<S, F, Fut, T, E>(&self, sleeper: &S, mut f: F) -> Result<T, E>
    where
        S: Sleep + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.next_delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(attempt, kind = %e.kind(), error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}

/// Waits for a duration. Injected into retry loops so they can be tested
/// without real time passing.
#[async_trait]
pub trait Sleep: Send + Sync {
    /// Sleeps for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

#[async_trait]
impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
