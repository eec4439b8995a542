// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry schedule, deadlines, cancellable sleeps.
//!
//! - [`RetryConfig`]: backoff schedule for the engine's reconnect loop
//! - [`with_timeout`]: bound a dependency wait with a deadline
//! - [`sleep_or_cancel`]: a backoff sleep that ends early on cancellation
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> index_sync::Result<()> {
//! use index_sync::resilience::{with_timeout, RetryConfig};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::default();
//! with_timeout("connect", retry.connection_timeout, async { Ok(()) }).await?;
//! assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(5));
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::IndexSyncConfig;
use crate::error::{IndexSyncError, Result};

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (1.0 = constant delay).
    pub backoff_factor: f64,

    /// Deadline for all dependencies to report "reachable".
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    /// Retry forever every 5 seconds, 30 second connect deadline.
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.0,
            connection_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Constant-delay schedule taken from the engine configuration.
    pub fn from_config(config: &IndexSyncConfig) -> Self {
        let delay = config.retry_delay_duration();
        Self {
            max_attempts: usize::MAX,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            connection_timeout: config.connect_timeout_duration(),
        }
    }

    /// Fast retries for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Run `fut`, failing with [`IndexSyncError::Timeout`] after `after`.
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(IndexSyncError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

/// Sleep for `delay`, or fail with [`IndexSyncError::Stopped`] if `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IndexSyncError::Stopped),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
