use std::time::{Duration, SystemTime};

/// Configuration for the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often the aggregator emits metrics
    pub metrics_interval: Duration,
    /// Whether to emit an event for every failed attempt, not only the final one
    pub include_retry_details: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
            include_retry_details: false,
        }
    }
}

/// A monitoring event emitted by a shard consumer
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Partition this event relates to
    pub partition_id: String,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

#[derive(Debug, Clone)]
pub enum ProcessingEventType {
    RecordAttempt {
        offset: u64,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    },
    RecordDelivered {
        offset: u64,
    },
    RecordSkipped {
        offset: u64,
        error: String,
    },
    BatchComplete {
        delivered_count: usize,
        skipped_count: usize,
        duration: Duration,
    },
    Checkpoint {
        offset: u64,
        success: bool,
        error: Option<String>,
    },
    SourceError {
        error: String,
        transient: bool,
    },
    PartitionEvent {
        event_type: PartitionEventType,
        details: Option<String>,
    },
}

/// Partition-level lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEventType {
    /// Consumer loaded its checkpoint and began polling
    Started,
    /// Consumer drained and stopped
    Stopped,
    /// Consumer halted on a poison record or checkpoint failure
    Halted,
    /// Partition disappeared from the source
    Closed,
}

impl ProcessingEvent {
    fn new(partition_id: String, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            partition_id,
            event_type,
        }
    }

    pub fn record_attempt(
        partition_id: String,
        offset: u64,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    ) -> Self {
        Self::new(
            partition_id,
            ProcessingEventType::RecordAttempt {
                offset,
                success,
                attempt_number,
                duration,
                error,
                is_final_attempt,
            },
        )
    }

    pub fn record_delivered(partition_id: String, offset: u64) -> Self {
        Self::new(partition_id, ProcessingEventType::RecordDelivered { offset })
    }

    pub fn record_skipped(partition_id: String, offset: u64, error: String) -> Self {
        Self::new(partition_id, ProcessingEventType::RecordSkipped { offset, error })
    }

    pub fn batch_complete(
        partition_id: String,
        delivered_count: usize,
        skipped_count: usize,
        duration: Duration,
    ) -> Self {
        Self::new(
            partition_id,
            ProcessingEventType::BatchComplete {
                delivered_count,
                skipped_count,
                duration,
            },
        )
    }

    pub fn checkpoint(
        partition_id: String,
        offset: u64,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::new(
            partition_id,
            ProcessingEventType::Checkpoint {
                offset,
                success,
                error,
            },
        )
    }

    pub fn source_error(partition_id: String, error: String, transient: bool) -> Self {
        Self::new(partition_id, ProcessingEventType::SourceError { error, transient })
    }

    pub fn partition_event(
        partition_id: String,
        event_type: PartitionEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            partition_id,
            ProcessingEventType::PartitionEvent {
                event_type,
                details,
            },
        )
    }
}
