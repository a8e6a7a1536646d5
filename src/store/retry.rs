//! Exponential backoff retry logic for store operations.
//!
//! Transient store failures (timeouts, pool exhaustion, connectivity
//! loss) are retried with exponential backoff; everything else is
//! returned immediately. Defaults: 3 attempts with 100 ms initial delay,
//! doubling, capped at 5 s.
//!
//! Cancellation is observed before every attempt and during every
//! backoff sleep; a cancelled policy makes no further attempts.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::error::StoreError;

/// Configuration for exponential backoff retry.
///
/// Construct via [`RetryConfig::new`], which coerces out-of-range values
/// rather than rejecting them: a multiplier of 1.0 or below becomes 2.0,
/// and delays below one millisecond become one millisecond.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of invocations of the operation (including the
    /// initial attempt).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl RetryConfig {
    /// Default retry configuration for store writes.
    ///
    /// - 3 attempts with 100 ms, 200 ms delays between them
    /// - Total max wait: ~300 ms
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    };

    /// Creates a retry configuration, coercing out-of-range values.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: initial_delay.max(Duration::from_millis(1)),
            max_delay: max_delay.max(Duration::from_millis(1)),
            multiplier: if multiplier <= 1.0 { 2.0 } else { multiplier },
        }
    }

    /// Computes the delay for the given retry (0-indexed: the sleep after
    /// the first failed attempt is attempt 0).
    ///
    /// The delay grows exponentially: `initial_delay * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// Returns an iterator over all backoff delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Computes the total maximum wait time across all backoff sleeps.
    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The operation failed with a non-retriable error (permanent or
    /// already-exists); no retry was attempted.
    #[error("{0}")]
    Aborted(StoreError),

    /// Transient failures persisted through every attempt.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// The last transient error encountered.
        last_error: StoreError,
        /// Number of invocations made.
        attempts: u32,
    },

    /// Cancellation was observed before or between attempts.
    #[error("operation cancelled")]
    Cancelled,
}

impl RetryError {
    /// Extracts the underlying store error, mapping cancellation to a
    /// permanent error.
    pub fn into_store_error(self) -> StoreError {
        match self {
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Cancelled => StoreError::permanent("operation cancelled"),
        }
    }
}

/// Executes an async store operation with retry logic.
///
/// The operation is invoked at most `config.max_attempts` times. It is
/// re-invoked only after a transient error; permanent and already-exists
/// errors abort immediately. Cancellation is checked before each attempt
/// and interrupts backoff sleeps.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;

                if !e.kind.is_retriable() {
                    return Err(RetryError::Aborted(e));
                }
                if attempt >= config.max_attempts {
                    return Err(RetryError::Exhausted {
                        last_error: e,
                        attempts: attempt,
                    });
                }

                let delay = config.delay_for_attempt(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
