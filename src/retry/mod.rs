//! Retry, backoff and polling helpers

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use error::RetryError;

use std::future::Future;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (None for infinite)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff schedule described by this configuration
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation with backoff until it succeeds, the attempt limit is
    /// reached, or `shutdown` flips to true.
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        mut operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        loop {
            if *shutdown.borrow() {
                return Err(RetryError::Interrupted);
            }

            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            select! {
                result = operation() => {
                    match result {
                        Ok(value) => {
                            debug!(attempts = self.attempts, "Operation succeeded");
                            return Ok(value);
                        }
                        Err(e) => {
                            if let Some(max) = self.config.max_retries {
                                if self.attempts >= max {
                                    warn!(
                                        attempts = self.attempts,
                                        error = %e,
                                        "Maximum retry attempts exceeded"
                                    );
                                    return Err(RetryError::MaxRetriesExceeded(self.attempts, e.to_string()));
                                }
                            }

                            let delay = self.backoff.next_delay(self.attempts - 1);
                            warn!(
                                attempt = self.attempts,
                                delay_ms = ?delay.as_millis(),
                                error = %e,
                                "Operation failed, retrying after delay"
                            );

                            if !sleep_or_shutdown(delay, shutdown).await {
                                debug!("Retry interrupted by shutdown signal");
                                return Err(RetryError::Interrupted);
                            }
                        }
                    }
                }
                _ = wait_for_shutdown(shutdown) => {
                    debug!("Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    /// Reset the retry counter
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleeps for `delay` unless shutdown is requested first.
///
/// Returns `true` when the full delay elapsed.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

/// Polls `condition` every `interval` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(
    mut condition: F,
    interval: Duration,
    timeout: Duration,
) -> Result<(), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::Timeout(timeout));
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
