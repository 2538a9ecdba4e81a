//! Kinesis Listener - checkpointed, at-least-once stream consumption
//!
//! A [`ConsumerGroup`] discovers the partitions of a stream and runs one
//! [`ShardConsumer`] per partition. Each consumer polls its partition from a
//! [`RecordSource`], hands records to a [`RecordProcessor`] in offset order,
//! and records progress in a [`CheckpointStore`] so a restart resumes after
//! the last acknowledged record.

pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod listener;
pub mod monitoring;
pub mod processor;
pub mod record;
pub mod retry;
pub mod source;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use config::{ConsumerConfig, PoisonRecordPolicy};
pub use consumer::{ConsumerExit, ConsumerState, ConsumerStatus, ShardConsumer};
pub use error::{ConsumerError, ProcessingError, Result, SourceError};
pub use group::{ConsumerGroup, ReconcileReport, StopReport};
pub use listener::{MessageHandler, MessageListener};
pub use record::Record;
pub use retry::{Backoff, ExponentialBackoff};

// Re-export main traits
pub use crate::processor::RecordProcessor;
pub use crate::source::RecordSource;
pub use crate::store::CheckpointStore;

// Re-export implementations
pub use crate::source::InMemoryRecordSource;
pub use crate::store::{FileCheckpointStore, InMemoryCheckpointStore};

#[cfg(feature = "dynamodb-store")]
pub use crate::store::{DynamoDbCheckpointStore, DynamoDbSettings};
