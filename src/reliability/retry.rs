//! Retry utilities with exponential backoff.
//!
//! Repeats an operation-producing function up to a bounded number of
//! attempts. Delays between attempts come from `backon`'s exponential
//! builder; the loop itself is explicit so the attempt count is exact.
//!
//! # Example
//!
//! ```rust,ignore
//! use steadykv::reliability::retry::{retry_async, RetryConfig};
//!
//! let result = retry_async(
//!     &RetryConfig::immediate(3),
//!     || async { backend_call().await },
//!     |e: &StoreError| e.is_retryable(),
//! ).await;
//! ```

use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one. Clamped to 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_TRANSACTION_RETRIES,
            initial_delay: Duration::from_millis(constants::DEFAULT_RETRY_DELAY_MS),
            max_delay: Duration::from_millis(constants::DEFAULT_RETRY_MAX_DELAY_MS),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry `max_attempts` times without waiting in between.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Attempt budget after clamping.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Build the exponential backoff strategy.
    fn build_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.attempts().saturating_sub(1) as usize)
            .with_factor(self.factor)
    }
}

/// Retry an async operation.
///
/// Resolves with the first success, or with the last error once the attempt
/// budget is spent. An error rejected by `is_retryable` ends the loop at
/// once.
pub async fn retry_async<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    retry_with_hook(config, operation, is_retryable, |_, _| std::future::ready(())).await
}

/// Retry an async operation, awaiting `on_failed_attempt` before each retry.
///
/// The hook receives the error and the 1-based number of the attempt that
/// failed. It is not called after the final attempt nor for errors that are
/// not retried.
pub async fn retry_with_hook<F, Fut, T, E, R, H, HFut>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
    mut on_failed_attempt: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
    H: FnMut(&E, u32) -> HFut,
    HFut: Future<Output = ()>,
{
    let max_attempts = config.attempts();
    let mut delays = config.build_backoff().build();
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "Operation succeeded after retries");
                }
                return Ok(result);
            },
            Err(e) => {
                if !is_retryable(&e) {
                    debug!(attempt = attempt, error = %e, "Permanent error, not retrying");
                    return Err(e);
                }

                if attempt >= max_attempts {
                    warn!(attempts = attempt, error = %e, "Max attempts exhausted");
                    return Err(e);
                }

                let delay = delays.next().unwrap_or(config.max_delay);
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    next_delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, will retry"
                );

                on_failed_attempt(&e, attempt).await;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            },
        }
    }
}
