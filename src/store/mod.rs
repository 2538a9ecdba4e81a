//! Checkpoint storage implementations

use async_trait::async_trait;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod file;
pub mod memory;

/// Durable mapping from partition id to the last acknowledged offset.
///
/// Each partition has exactly one writer, its shard consumer. Implementations
/// must be atomic per partition and give that writer read-your-writes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieve the checkpoint for a given partition
    async fn get_checkpoint(&self, partition_id: &str) -> anyhow::Result<Option<u64>>;

    /// Save a checkpoint for a given partition
    async fn save_checkpoint(&self, partition_id: &str, offset: u64) -> anyhow::Result<()>;
}

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::{DynamoDbCheckpointStore, DynamoDbSettings};
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
