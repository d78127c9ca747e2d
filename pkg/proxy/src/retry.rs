//! Retry with exponential backoff and jitter for executor calls.

use std::time::Duration;

use pkg_constants::proxy::{
    DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use rand::Rng;
use tracing::{error, warn};

use crate::error::ProxyError;

/// Backoff schedule for failable operations.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included (0 = infinite)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            backoff_multiplier: 2.0,
        }
    }
}

/// Errors that may go away on their own.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ProxyError {
    fn is_transient(&self) -> bool {
        ProxyError::is_transient(self)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Permanent error, or the last transient one once attempts ran out.
    Failed { error: E, attempts: u32 },
    /// `cancelled` returned true between attempts.
    Cancelled { attempts: u32 },
}

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `cancelled` reports that the work is no longer wanted.
///
/// The operation receives the 1-based attempt number.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancelled: impl Fn() -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Transient,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !e.is_transient() {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed permanently"
            );
            return Err(RetryError::Failed { error: e, attempts: attempt });
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(RetryError::Failed { error: e, attempts: attempt });
        }
        if cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        // Jitter: 0.5x to 1.5x of the delay
        let jitter = rand::rng().random_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(jittered_delay).await;
        if cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
