use crate::store::CheckpointStore;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

/// In-memory implementation of checkpoint storage.
///
/// Not durable across process restarts; clones share the same map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, u64>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory checkpoint store");
        Self::default()
    }

    /// Snapshot of every stored checkpoint
    pub async fn all(&self) -> HashMap<String, u64> {
        self.checkpoints.read().await.clone()
    }

    #[cfg(test)]
    pub async fn clear(&self) {
        self.checkpoints.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    #[instrument(skip(self))]
    async fn get_checkpoint(&self, partition_id: &str) -> anyhow::Result<Option<u64>> {
        let checkpoint = self.checkpoints.read().await.get(partition_id).copied();

        trace!(
            partition_id = %partition_id,
            checkpoint = ?checkpoint,
            "Retrieved checkpoint from memory"
        );

        Ok(checkpoint)
    }

    #[instrument(skip(self))]
    async fn save_checkpoint(&self, partition_id: &str, offset: u64) -> anyhow::Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let current = checkpoints.entry(partition_id.to_string()).or_insert(offset);

        if offset < *current {
            warn!(
                partition_id = %partition_id,
                offset = offset,
                current = *current,
                "Ignoring backward checkpoint"
            );
            return Ok(());
        }

        *current = offset;
        trace!(partition_id = %partition_id, offset = offset, "Checkpoint saved to memory");
        Ok(())
    }
}
