//! Retry primitives for pipeline I/O
//!
//! - Retry configuration (bounded exponential backoff with jitter)
//! - [`retry`]: runs an async operation until it succeeds, fails with a
//!   non-retriable error, exhausts its budget, or a stop signal arrives

use crate::common::{CdcError, Result, Shutdown};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry configuration with exponential backoff.
///
/// The budget is always finite: once `max_retries` retries have failed the
/// operation surfaces [`CdcError::RetriesExhausted`].
///
/// # Example
///
/// ```rust
/// use lakesync_cdc::common::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .retry_delay(Duration::from_millis(200))
///     .build();
///
/// assert_eq!(config.max_retries(), 5);
/// assert!(config.should_retry(4));
/// assert!(!config.should_retry(5));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts after the first failure (`0` = no retries).
    max_retries: u32,
    /// Base delay between retries (before exponential backoff).
    retry_delay: Duration,
    /// Maximum delay cap.
    max_delay: Duration,
    /// Jitter factor (0.0 - 1.0) applied to each delay.
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a builder for RetryConfig.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Create a disabled retry config (no retries).
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Get maximum retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get base retry delay.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Get maximum delay cap.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Get jitter factor.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Check if we should retry after `attempt` retries have already been made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Calculate delay for a given attempt (with exponential backoff and jitter).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(30)));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let jitter_range = capped.as_secs_f64() * self.jitter;
            // Deterministic jitter (golden ratio sequence)
            let jitter_offset = (attempt as f64 * 0.618033988749895) % 1.0;
            let jitter_amount = jitter_range * (jitter_offset * 2.0 - 1.0);
            let adjusted = capped.as_secs_f64() + jitter_amount;
            Duration::from_secs_f64(adjusted.max(0.0))
        } else {
            capped
        }
    }
}

/// Builder for RetryConfig.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    /// Set maximum retry attempts.
    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = Some(value);
        self
    }

    /// Set base retry delay.
    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    /// Set maximum delay cap.
    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    /// Set jitter factor (0.0 - 1.0).
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    /// Build the RetryConfig.
    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        let retry_delay = self.retry_delay.unwrap_or(defaults.retry_delay);
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay,
            max_delay: self.max_delay.unwrap_or(defaults.max_delay).max(retry_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

// ============================================================================
// Retry Loop
// ============================================================================

/// Run `op` until it succeeds.
///
/// Non-retriable errors are returned as-is on the first failure. Retriable
/// errors are retried with backoff until the budget in `config` is spent,
/// then wrapped in [`CdcError::RetriesExhausted`]. A stop signal during a
/// backoff sleep returns [`CdcError::Shutdown`]; an attempt already in
/// flight is never interrupted.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    shutdown: &mut Shutdown,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempts = attempt + 1, "Operation recovered");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) => {
                if !config.should_retry(attempt) {
                    return Err(CdcError::retries_exhausted(operation, attempt + 1, e));
                }
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    max_retries = config.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => return Err(CdcError::Shutdown),
                }
            }
        }
    }
}
