use std::time::Duration;
use thiserror::Error;

/// Why a retried or awaited operation gave up
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Condition not met within {0:?}")]
    Timeout(Duration),

    #[error("Gave up after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Interrupted by shutdown")]
    Interrupted,
}
