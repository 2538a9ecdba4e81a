//! Record sources: partitioned, append-only logs the consumers read from

use async_trait::async_trait;

use crate::error::SourceError;
use crate::record::Record;

pub mod memory;

pub use memory::InMemoryRecordSource;

/// Read side of a partitioned, append-only log.
///
/// An empty batch from [`poll`](RecordSource::poll) is a normal response
/// meaning "nothing new yet".
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// List the partition ids currently present in `stream`
    async fn list_partitions(&self, stream: &str) -> Result<Vec<String>, SourceError>;

    /// Fetch up to `limit` records of `partition_id` whose offset is strictly
    /// greater than `after_offset`, in offset order. `None` reads from the
    /// earliest retained record.
    async fn poll(
        &self,
        stream: &str,
        partition_id: &str,
        after_offset: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Record>, SourceError>;
}
