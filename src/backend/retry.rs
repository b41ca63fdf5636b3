//! Exponential backoff retry for backend calls.
//!
//! Only transient errors are retried. Permanent errors come back on the first
//! attempt. Every attempt is bounded by a per-call timeout, and waits between
//! attempts end early when the caller's cancellation token fires.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{BackendError, BackendErrorKind};

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 3 retries with 2s, 4s, 8s delays.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(16),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Delay before retry `attempt` (0-indexed):
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of a retried call.
#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),

    /// Transient errors persisted through every attempt.
    ExhaustedRetries {
        last_error: BackendError,
        /// Attempts made, including the initial one.
        attempts: u32,
    },

    PermanentError(BackendError),

    /// The cancellation token fired before the call succeeded.
    Cancelled,
}

/// Executes an async backend call with timeout, retry and cancellation.
///
/// `operation` is invoked once per attempt. An attempt that exceeds
/// `call_timeout` counts as a transient failure.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    call_timeout: Duration,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => return RetryResult::Cancelled,
            outcome = tokio::time::timeout(call_timeout, operation()) => outcome,
        };
        let error = match outcome {
            Ok(Ok(value)) => return RetryResult::Success(value),
            Ok(Err(e)) => e,
            Err(_) => BackendError::transient(format!(
                "call timed out after {}s",
                call_timeout.as_secs_f64()
            )),
        };
        attempt += 1;

        match error.kind {
            BackendErrorKind::Permanent => return RetryResult::PermanentError(error),
            BackendErrorKind::Transient => {
                if attempt >= max_attempts {
                    return RetryResult::ExhaustedRetries {
                        last_error: error,
                        attempts: attempt,
                    };
                }

                let delay = config.delay_for_attempt(attempt - 1);
                debug!(attempt, ?delay, error = %error, "retrying backend call");
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return RetryResult::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
