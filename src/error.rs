//! Error types for the stream consumer

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Transient source error on partition {partition_id}: {message}")]
    TransientSource {
        partition_id: String,
        message: String,
    },

    #[error("Processor failed on partition {partition_id} at offset {offset}: {message}")]
    Processor {
        partition_id: String,
        offset: u64,
        message: String,
    },

    #[error("Partition {partition_id} halted at offset {offset}: {message}")]
    FatalPartition {
        partition_id: String,
        offset: u64,
        message: String,
    },

    #[error("Failed to write checkpoint {offset} for partition {partition_id}: {message}")]
    CheckpointWrite {
        partition_id: String,
        offset: u64,
        message: String,
    },

    #[error("Failed to read checkpoint for partition {partition_id}: {message}")]
    CheckpointRead {
        partition_id: String,
        message: String,
    },

    #[error("Partition discovery failed: {0}")]
    Discovery(String),

    #[error("Record processing attempt timed out after {0:?}")]
    ProcessingTimeout(Duration),

    #[error("Maximum retry attempts reached: {0}")]
    MaxRetriesExceeded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Consumer for partition {0} is already running")]
    AlreadyRunning(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    /// A checkpoint failure is not final: the group may recreate the
    /// consumer on its next reconcile.
    pub fn is_checkpoint_failure(&self) -> bool {
        matches!(
            self,
            ConsumerError::CheckpointWrite { .. } | ConsumerError::CheckpointRead { .. }
        )
    }
}

impl From<JoinError> for ConsumerError {
    fn from(err: JoinError) -> Self {
        ConsumerError::Other(err.into())
    }
}

impl From<crate::retry::RetryError> for ConsumerError {
    fn from(err: crate::retry::RetryError) -> Self {
        use crate::retry::RetryError;
        match err {
            RetryError::Timeout(d) => ConsumerError::ProcessingTimeout(d),
            RetryError::MaxRetriesExceeded(attempts, msg) => {
                ConsumerError::MaxRetriesExceeded(format!("After {} attempts: {}", attempts, msg))
            }
            RetryError::Interrupted => ConsumerError::Shutdown,
        }
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors reported by a [`RecordSource`](crate::source::RecordSource)
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Record source unavailable: {0}")]
    Unavailable(String),

    #[error("Throughput exceeded")]
    Throttled,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Transient errors are retried with backoff and never leave the consumer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Unavailable(_)
                | SourceError::Throttled
                | SourceError::Timeout(_)
                | SourceError::Other(_)
        )
    }
}

/// Outcome of a failed processor invocation
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Soft failure (retriable): {0}")]
    SoftFailure(#[source] anyhow::Error),

    #[error("Hard failure (non-retriable): {0}")]
    HardFailure(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::SoftFailure(err.into())
    }

    pub fn hard(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::HardFailure(err.into())
    }

    pub fn is_hard(&self) -> bool {
        matches!(self, ProcessingError::HardFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryError;

    #[test]
    fn test_error_conversions() {
        let retry_err = RetryError::MaxRetriesExceeded(3, "test".to_string());
        let err: ConsumerError = retry_err.into();
        assert!(matches!(err, ConsumerError::MaxRetriesExceeded(_)));

        let err: ConsumerError = RetryError::Interrupted.into();
        assert!(matches!(err, ConsumerError::Shutdown));

        let err: ConsumerError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ConsumerError::Other(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = ConsumerError::ProcessingTimeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));

        let err = ConsumerError::FatalPartition {
            partition_id: "shard-1".to_string(),
            offset: 7,
            message: "poison".to_string(),
        };
        assert!(err.to_string().contains("shard-1"));
        assert!(err.to_string().contains('7'));
        assert!(!err.is_checkpoint_failure());

        let err = ConsumerError::CheckpointWrite {
            partition_id: "shard-1".to_string(),
            offset: 3,
            message: "disk full".to_string(),
        };
        assert!(err.is_checkpoint_failure());
    }

    #[test]
    fn test_source_error_classification() {
        assert!(SourceError::Throttled.is_transient());
        assert!(SourceError::Unavailable("down".to_string()).is_transient());
        assert!(!SourceError::PartitionNotFound("shard-9".to_string()).is_transient());
        assert!(!SourceError::StreamNotFound("s".to_string()).is_transient());
    }

    #[test]
    fn test_processing_error_kinds() {
        assert!(ProcessingError::hard(anyhow::anyhow!("bad")).is_hard());
        assert!(!ProcessingError::soft(anyhow::anyhow!("later")).is_hard());
    }
}
