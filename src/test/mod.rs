//! Test utilities and mock implementations for testing shard consumers


use chrono::Utc;
use std::time::Duration;

use crate::config::ConsumerConfig;
use crate::record::Record;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    pub fn create_test_record(partition_id: &str, offset: u64, payload: &str) -> Record {
        Record::new(partition_id, offset, payload.to_string(), Utc::now())
    }

    /// Records with payloads `data-0`, `data-1`, ... at offsets 0, 1, ...
    pub fn create_test_records(partition_id: &str, count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Self::create_test_record(partition_id, i as u64, &format!("data-{}", i)))
            .collect()
    }

    /// Configuration with short intervals so tests finish quickly
    pub fn fast_config(stream_name: &str) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval_min: Duration::from_millis(10),
            poll_interval_max: Duration::from_millis(50),
            retry_backoff_initial: Duration::from_millis(5),
            retry_backoff_max: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..ConsumerConfig::new(stream_name)
        }
    }
}

#[cfg(test)]
pub fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("kinesis_listener=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_records() {
        let records = TestUtils::create_test_records("shard-0", 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].offset(), 2);
        assert_eq!(records[1].payload_str().unwrap(), "data-1");
        assert!(TestUtils::fast_config("test-stream").validate().is_ok());
    }
}
