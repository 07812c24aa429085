//! Transfer Retry Logic
//!
//! Provides automatic retry with exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{StorageError, StorageResult};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each retry
    pub backoff_multiplier: f64,

    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }
}

/// Calculate backoff delay for a given retry attempt (exponential backoff)
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64);

    Duration::from_millis(delay_ms as u64)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Backoff sleeps wake early on cancellation.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= config.max_retries => {
                warn!("{} failed after {} attempts: {}", label, attempt + 1, e);
                return Err(e);
            }
            Err(e) => {
                let delay = calculate_backoff(attempt, config);
                info!("{} failed, retrying in {:?}: {}", label, delay, e);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        info!("{} cancelled during backoff", label);
                        return Err(StorageError::Cancelled);
                    }
                }
                attempt += 1;
            }
        }
    }
}
