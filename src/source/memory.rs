use crate::error::SourceError;
use crate::record::Record;
use crate::source::RecordSource;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// In-memory partitioned log.
///
/// Serves a single stream; the stream name passed to [`RecordSource`]
/// methods must match the one given at construction.
#[derive(Debug, Clone)]
pub struct InMemoryRecordSource {
    stream_name: String,
    partitions: Arc<RwLock<BTreeMap<String, Vec<Record>>>>,
}

impl InMemoryRecordSource {
    pub fn new(stream_name: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        debug!(stream = %stream_name, "Initializing in-memory record source");
        Self {
            stream_name,
            partitions: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Create a source with `count` empty partitions named `shard-0`, `shard-1`, ...
    pub async fn with_partitions(stream_name: impl Into<String>, count: usize) -> Self {
        let source = Self::new(stream_name);
        for i in 0..count {
            source.create_partition(format!("shard-{}", i)).await;
        }
        source
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Add an empty partition. Existing partitions are left untouched.
    pub async fn create_partition(&self, partition_id: impl Into<String>) {
        let partition_id = partition_id.into();
        self.partitions
            .write()
            .await
            .entry(partition_id)
            .or_default();
    }

    pub async fn remove_partition(&self, partition_id: &str) -> bool {
        self.partitions.write().await.remove(partition_id).is_some()
    }

    /// Append a payload to `partition_id`, returning the assigned offset.
    ///
    /// Offsets start at 0 and increase by one per append.
    pub async fn append(
        &self,
        partition_id: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64, SourceError> {
        let mut partitions = self.partitions.write().await;
        let records = partitions
            .get_mut(partition_id)
            .ok_or_else(|| SourceError::PartitionNotFound(partition_id.to_string()))?;

        let offset = records.last().map_or(0, |r| r.offset() + 1);
        records.push(Record::new(partition_id, offset, payload, Utc::now()));

        trace!(partition_id = %partition_id, offset = offset, "Appended record");
        Ok(offset)
    }

    pub async fn len(&self, partition_id: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(partition_id)
            .map_or(0, Vec::len)
    }

    fn check_stream(&self, stream: &str) -> Result<(), SourceError> {
        if stream == self.stream_name {
            Ok(())
        } else {
            Err(SourceError::StreamNotFound(stream.to_string()))
        }
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn list_partitions(&self, stream: &str) -> Result<Vec<String>, SourceError> {
        self.check_stream(stream)?;
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn poll(
        &self,
        stream: &str,
        partition_id: &str,
        after_offset: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Record>, SourceError> {
        self.check_stream(stream)?;

        let partitions = self.partitions.read().await;
        let records = partitions
            .get(partition_id)
            .ok_or_else(|| SourceError::PartitionNotFound(partition_id.to_string()))?;

        let start = match after_offset {
            Some(offset) => records.partition_point(|r| r.offset() <= offset),
            None => 0,
        };

        Ok(records.iter().skip(start).take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_append_assigns_increasing_offsets() -> anyhow::Result<()> {
        let source = InMemoryRecordSource::new("stream");
        source.create_partition("shard-1").await;

        assert_eq!(source.append("shard-1", "a").await?, 0);
        assert_eq!(source.append("shard-1", "b").await?, 1);
        assert_eq!(source.append("shard-1", "c").await?, 2);
        assert_eq!(source.len("shard-1").await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_after_offset_and_limit() -> anyhow::Result<()> {
        let source = InMemoryRecordSource::new("stream");
        source.create_partition("shard-1").await;
        for payload in ["a", "b", "c", "d"] {
            source.append("shard-1", payload).await?;
        }

        let all = source.poll("stream", "shard-1", None, 10).await?;
        assert_eq!(all.iter().map(Record::offset).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let tail = source.poll("stream", "shard-1", Some(1), 10).await?;
        assert_eq!(tail.iter().map(Record::offset).collect::<Vec<_>>(), vec![2, 3]);

        let limited = source.poll("stream", "shard-1", None, 2).await?;
        assert_eq!(limited.len(), 2);

        let empty = source.poll("stream", "shard-1", Some(3), 10).await?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_partition_and_stream() -> anyhow::Result<()> {
        let source = InMemoryRecordSource::with_partitions("stream", 2).await;
        assert_eq!(
            source.list_partitions("stream").await?,
            vec!["shard-0".to_string(), "shard-1".to_string()]
        );

        assert!(matches!(
            source.poll("stream", "shard-9", None, 10).await,
            Err(SourceError::PartitionNotFound(_))
        ));
        assert!(matches!(
            source.list_partitions("other").await,
            Err(SourceError::StreamNotFound(_))
        ));
        assert!(matches!(
            source.append("shard-9", "x").await,
            Err(SourceError::PartitionNotFound(_))
        ));

        assert!(source.remove_partition("shard-0").await);
        assert_eq!(source.list_partitions("stream").await?, vec!["shard-1".to_string()]);
        Ok(())
    }
}
