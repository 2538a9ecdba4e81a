// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use kinesis_listener::retry::wait_until;
use kinesis_listener::{ConsumerConfig, MessageHandler, ProcessingError, Record, RecordProcessor};
use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::RwLock;

pub const STREAM_NAME: &str = "kinesis-with-localstack-example";

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("kinesis_listener=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    });
}

pub fn create_test_config() -> ConsumerConfig {
    ConsumerConfig {
        poll_interval_min: Duration::from_millis(10),
        poll_interval_max: Duration::from_millis(100),
        retry_backoff_initial: Duration::from_millis(5),
        retry_backoff_max: Duration::from_millis(50),
        max_retries: 2,
        shutdown_timeout: Duration::from_secs(5),
        ..ConsumerConfig::new(STREAM_NAME)
    }
}

/// Collects every message it is handed
#[derive(Debug, Clone, Default)]
pub struct CollectingHandler {
    messages: Arc<RwLock<Vec<String>>>,
}

impl CollectingHandler {
    pub async fn messages(&self) -> Vec<String> {
        self.messages.read().await.clone()
    }

    /// Wait until at least `count` messages arrived
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> anyhow::Result<Vec<String>> {
        let messages = self.messages.clone();
        wait_until(
            move || {
                let messages = messages.clone();
                async move { messages.read().await.len() >= count }
            },
            Duration::from_millis(10),
            timeout,
        )
        .await?;
        Ok(self.messages().await)
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle_message(&self, message: &str) -> anyhow::Result<()> {
        self.messages.write().await.push(message.to_string());
        Ok(())
    }
}

/// Records payloads per partition, sleeping on the partitions listed in `slow`
#[derive(Debug, Clone, Default)]
pub struct PartitionRecorder {
    delivered: Arc<RwLock<HashMap<String, Vec<String>>>>,
    slow: Arc<HashMap<String, Duration>>,
}

impl PartitionRecorder {
    pub fn with_slow_partition(partition_id: &str, delay: Duration) -> Self {
        Self {
            slow: Arc::new([(partition_id.to_string(), delay)].into_iter().collect()),
            ..Default::default()
        }
    }

    pub async fn delivered(&self, partition_id: &str) -> Vec<String> {
        self.delivered
            .read()
            .await
            .get(partition_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordProcessor for PartitionRecorder {
    async fn process_record(&self, record: &Record) -> Result<(), ProcessingError> {
        if let Some(delay) = self.slow.get(record.partition_id()) {
            tokio::time::sleep(*delay).await;
        }
        let payload = record.payload_str().map_err(ProcessingError::hard)?;
        self.delivered
            .write()
            .await
            .entry(record.partition_id().to_string())
            .or_default()
            .push(payload.to_string());
        Ok(())
    }
}
