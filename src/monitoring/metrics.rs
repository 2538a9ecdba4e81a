use super::types::{MonitoringConfig, PartitionEventType, ProcessingEvent, ProcessingEventType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Aggregated metrics for a single partition
#[derive(Debug, Clone)]
pub struct PartitionMetrics {
    pub records_delivered: u64,
    pub records_skipped: u64,
    pub failed_attempts: u64,
    pub retry_attempts: u64,
    pub processing_time: Duration,
    pub max_processing_time: Duration,

    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,
    pub last_checkpoint: Option<u64>,

    pub transient_source_errors: u64,
    pub fatal_source_errors: u64,
    pub halted: bool,

    pub last_updated: Instant,
}

impl Default for PartitionMetrics {
    fn default() -> Self {
        Self {
            records_delivered: 0,
            records_skipped: 0,
            failed_attempts: 0,
            retry_attempts: 0,
            processing_time: Duration::default(),
            max_processing_time: Duration::default(),
            checkpoints_succeeded: 0,
            checkpoints_failed: 0,
            last_checkpoint: None,
            transient_source_errors: 0,
            fatal_source_errors: 0,
            halted: false,
            last_updated: Instant::now(),
        }
    }
}

impl PartitionMetrics {
    /// Mean duration of a processor attempt in this window
    pub fn avg_processing_time(&self) -> Duration {
        let attempts = self.records_delivered + self.failed_attempts;
        if attempts == 0 {
            Duration::default()
        } else {
            self.processing_time.div_f64(attempts as f64)
        }
    }
}

/// Folds monitoring events into per-partition metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, PartitionMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Aggregator whose window is `config.metrics_interval`
    pub fn from_config(
        config: &MonitoringConfig,
        monitoring_rx: mpsc::Receiver<ProcessingEvent>,
    ) -> Self {
        Self::new(config.metrics_interval, monitoring_rx)
    }

    /// Shared view of the metrics, usable after `run` takes ownership
    pub fn handle(&self) -> Arc<RwLock<HashMap<String, PartitionMetrics>>> {
        self.metrics.clone()
    }

    /// Consume events until every sender is dropped, logging metrics each window
    pub async fn run(mut self) {
        let mut ticker = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => {
                    match event {
                        Some(event) => self.process_event(event).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.emit_metrics().await;
                }
            }
        }

        self.emit_metrics().await;
        debug!("Monitoring channel closed, metrics aggregator stopped");
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let mut metrics = self.metrics.write().await;
        let partition = metrics.entry(event.partition_id.clone()).or_default();

        match event.event_type {
            ProcessingEventType::RecordAttempt {
                success,
                attempt_number,
                duration,
                ..
            } => {
                if !success {
                    partition.failed_attempts += 1;
                }
                if attempt_number > 1 {
                    partition.retry_attempts += 1;
                }
                partition.processing_time += duration;
                if duration > partition.max_processing_time {
                    partition.max_processing_time = duration;
                }
            }
            ProcessingEventType::RecordDelivered { offset } => {
                partition.records_delivered += 1;
                trace!(partition_id = %event.partition_id, offset = offset, "Record delivered");
            }
            ProcessingEventType::RecordSkipped { offset, error } => {
                partition.records_skipped += 1;
                warn!(
                    partition_id = %event.partition_id,
                    offset = offset,
                    error = %error,
                    "Poison record skipped"
                );
            }
            ProcessingEventType::BatchComplete {
                delivered_count,
                skipped_count,
                duration,
            } => {
                debug!(
                    partition_id = %event.partition_id,
                    delivered = delivered_count,
                    skipped = skipped_count,
                    duration_ms = ?duration.as_millis(),
                    "Batch completed"
                );
            }
            ProcessingEventType::Checkpoint { offset, success, error } => {
                if success {
                    partition.checkpoints_succeeded += 1;
                    partition.last_checkpoint = Some(offset);
                } else {
                    partition.checkpoints_failed += 1;
                    warn!(
                        partition_id = %event.partition_id,
                        offset = offset,
                        error = ?error,
                        "Checkpoint failed"
                    );
                }
            }
            ProcessingEventType::SourceError { error, transient } => {
                if transient {
                    partition.transient_source_errors += 1;
                } else {
                    partition.fatal_source_errors += 1;
                }
                trace!(partition_id = %event.partition_id, error = %error, "Source error");
            }
            ProcessingEventType::PartitionEvent { event_type, details } => match event_type {
                PartitionEventType::Started => {
                    partition.halted = false;
                    debug!(partition_id = %event.partition_id, "Partition consumer started");
                }
                PartitionEventType::Stopped => {
                    debug!(partition_id = %event.partition_id, "Partition consumer stopped");
                }
                PartitionEventType::Halted => {
                    partition.halted = true;
                    warn!(
                        partition_id = %event.partition_id,
                        details = ?details,
                        "Partition consumer halted"
                    );
                }
                PartitionEventType::Closed => {
                    info!(partition_id = %event.partition_id, "Partition closed");
                }
            },
        }

        partition.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (partition_id, m) in metrics.iter() {
            if m.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                partition_id = %partition_id,
                records_delivered = m.records_delivered,
                records_skipped = m.records_skipped,
                failed_attempts = m.failed_attempts,
                retry_attempts = m.retry_attempts,
                avg_processing_time_ms = %m.avg_processing_time().as_millis(),
                max_processing_time_ms = %m.max_processing_time.as_millis(),
                checkpoints_succeeded = m.checkpoints_succeeded,
                checkpoints_failed = m.checkpoints_failed,
                last_checkpoint = ?m.last_checkpoint,
                transient_source_errors = m.transient_source_errors,
                halted = m.halted,
                "Metrics for window"
            );

            if m.checkpoints_failed > 0 {
                warn!(
                    partition_id = %partition_id,
                    failures = m.checkpoints_failed,
                    "Checkpoint failures detected"
                );
            }
        }
    }

    pub async fn get_metrics(&self) -> HashMap<String, PartitionMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_partition_metrics(&self, partition_id: &str) -> Option<PartitionMetrics> {
        self.metrics.read().await.get(partition_id).cloned()
    }
}
