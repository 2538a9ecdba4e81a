//! Filesystem-backed checkpoint storage.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::store::CheckpointStore;

/// On-disk checkpoint document, one per partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub partition_id: String,
    pub offset: u64,
    pub updated_at: DateTime<Utc>,
}

/// Stores each partition's checkpoint as a JSON file in a directory.
///
/// Writes go to a temporary file that is renamed over the previous one, so a
/// crash mid-write leaves the last complete checkpoint in place.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `checkpoint_<id>.json`, with every byte of the id other than ASCII
    /// alphanumerics and `-` written as `_xx` hex. `_` is escaped too, so
    /// distinct ids never share a file.
    fn path_for(&self, partition_id: &str) -> PathBuf {
        let mut file_stem = String::with_capacity(partition_id.len());
        for byte in partition_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_stem.push(byte as char);
            } else {
                file_stem.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("checkpoint_{}.json", file_stem))
    }

    async fn read(&self, partition_id: &str) -> anyhow::Result<Option<StoredCheckpoint>> {
        let path = self.path_for(partition_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let stored: StoredCheckpoint = serde_json::from_str(&content)
            .with_context(|| format!("Invalid checkpoint file {}", path.display()))?;

        if stored.partition_id != partition_id {
            bail!(
                "Checkpoint file {} belongs to partition {}, not {}",
                path.display(),
                stored.partition_id,
                partition_id
            );
        }

        Ok(Some(stored))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn get_checkpoint(&self, partition_id: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.read(partition_id).await?.map(|stored| stored.offset))
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn save_checkpoint(&self, partition_id: &str, offset: u64) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(current) = self.read(partition_id).await? {
            if offset < current.offset {
                warn!(
                    partition_id = %partition_id,
                    offset = offset,
                    current = current.offset,
                    "Ignoring backward checkpoint"
                );
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let stored = StoredCheckpoint {
            partition_id: partition_id.to_string(),
            offset,
            updated_at: Utc::now(),
        };

        let path = self.path_for(partition_id);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(&stored)?)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!(
            partition_id = %partition_id,
            offset = offset,
            path = %path.display(),
            "Checkpoint saved to file"
        );
        Ok(())
    }
}
