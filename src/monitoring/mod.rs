//! Monitoring for shard consumers
//!
//! Consumers optionally publish [`ProcessingEvent`]s on a bounded channel;
//! [`MetricsAggregator`] folds them into per-partition metrics.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, PartitionMetrics};
pub use types::{MonitoringConfig, PartitionEventType, ProcessingEvent, ProcessingEventType};
