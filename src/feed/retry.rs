//! Retry with exponential backoff for outbound calls.
//!
//! Delay for attempt `k` (0-based) is `base_delay * multiplier^k`, jittered
//! by `±jitter_fraction / 2` and capped at `max_delay`. Errors decide for
//! themselves whether they are worth retrying through [`Transient`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Width of the random jitter band as a fraction of the delay (0 disables)
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// HTTP status codes that are retried
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    32_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

/// Classifies an error for retry purposes.
pub trait Transient {
    /// HTTP status carried by the error, if any.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Transport-level transience (timeouts, resets, rate limiting).
    fn is_transient(&self) -> bool {
        false
    }
}

/// Failure of a retried operation.
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },

    /// The operation failed with an error that is not worth retrying.
    #[error("non-retryable failure: {0}")]
    Fatal(#[source] E),
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Fatal(_) => 1,
        }
    }

    /// The underlying error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::Fatal(e) => e,
        }
    }
}

/// Executes async operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Un-jittered backoff delay after the given 0-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.policy.base_delay_ms as f64 * self.policy.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.policy.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.policy.jitter_fraction <= 0.0 {
            return delay;
        }

        let offset = rand::thread_rng().gen_range(-0.5..0.5) * self.policy.jitter_fraction;
        let ms = (delay.as_millis() as f64 * (1.0 + offset)).min(self.policy.max_delay_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Whether an error should be retried under this policy.
    pub fn should_retry<E: Transient>(&self, error: &E) -> bool {
        if let Some(status) = error.status_code() {
            if self.policy.retryable_status_codes.contains(&status) {
                return true;
            }
        }
        error.is_transient()
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::error::Error + 'static,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;

                    if !self.should_retry(&error) {
                        return Err(RetryError::Fatal(error));
                    }
                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = self.jittered_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
