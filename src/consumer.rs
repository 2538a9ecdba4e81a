//! Shard consumer: checkpointed, in-order delivery for a single partition
//!
//! A [`ShardConsumer`] owns one partition. Its task repeatedly:
//!
//! - polls the record source for records after the last checkpoint
//! - backs off (capped exponential) while the partition is empty
//! - delivers each record to the processor, one at a time, in offset order
//! - persists the record's offset once the processor acknowledges it
//!
//! Failed deliveries are retried with backoff; when the retries run out the
//! configured [`PoisonRecordPolicy`] decides between skipping the record and
//! halting the partition.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConsumerConfig, PoisonRecordPolicy};
use crate::error::{ConsumerError, ProcessingError, Result, SourceError};
use crate::monitoring::{PartitionEventType, ProcessingEvent};
use crate::processor::RecordProcessor;
use crate::record::Record;
use crate::retry::{sleep_or_shutdown, wait_for_shutdown, Backoff};
use crate::source::RecordSource;
use crate::store::CheckpointStore;

/// Lifecycle of a shard consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Created, not started
    Idle,
    /// Polling and delivering records
    Polling,
    /// Stop requested; finishing the in-flight delivery
    Stopping,
    /// Task finished
    Stopped,
}

/// Why a shard consumer's task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Drained after a stop request
    Stopped,
    /// The partition no longer exists in the source
    Closed,
    /// A poison record halted the partition
    Halted(String),
    /// Reading or writing the checkpoint failed
    CheckpointFailed(String),
    /// Force-stopped before it could drain
    Aborted,
}

/// Point-in-time view of a shard consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStatus {
    pub partition_id: String,
    pub state: ConsumerState,
    /// Last offset persisted to the checkpoint store
    pub checkpoint: Option<u64>,
    pub exit: Option<ConsumerExit>,
}

impl ConsumerStatus {
    fn new(partition_id: String) -> Self {
        Self {
            partition_id,
            state: ConsumerState::Idle,
            checkpoint: None,
            exit: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(
            self.exit,
            None | Some(ConsumerExit::Stopped) | Some(ConsumerExit::Closed)
        )
    }

    /// Reason the partition is unhealthy, if it is
    pub fn failure(&self) -> Option<String> {
        match &self.exit {
            Some(ConsumerExit::Halted(reason)) | Some(ConsumerExit::CheckpointFailed(reason)) => {
                Some(reason.clone())
            }
            Some(ConsumerExit::Aborted) => Some("Force-stopped before draining".to_string()),
            _ => None,
        }
    }

    /// Whether a group may replace this consumer with a fresh one
    pub fn is_restartable(&self) -> bool {
        self.state == ConsumerState::Stopped
            && matches!(
                self.exit,
                Some(ConsumerExit::CheckpointFailed(_)) | Some(ConsumerExit::Closed)
            )
    }
}

/// Shared dependencies of the consumers in a group
pub struct ConsumerContext<P, R, S> {
    processor: Arc<P>,
    source: Arc<R>,
    store: Arc<S>,
    config: Arc<ConsumerConfig>,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<P, R, S> Clone for ConsumerContext<P, R, S> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            source: self.source.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            monitoring_tx: self.monitoring_tx.clone(),
        }
    }
}

impl<P, R, S> ConsumerContext<P, R, S>
where
    P: RecordProcessor + 'static,
    R: RecordSource + 'static,
    S: CheckpointStore + 'static,
{
    pub fn new(
        config: ConsumerConfig,
        processor: Arc<P>,
        source: Arc<R>,
        store: Arc<S>,
        monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
    ) -> Self {
        Self {
            processor,
            source,
            store,
            config: Arc::new(config),
            monitoring_tx,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub(crate) async fn list_partitions(&self) -> std::result::Result<Vec<String>, SourceError> {
        self.source.list_partitions(&self.config.stream_name).await
    }

    /// Publish a monitoring event without ever blocking delivery
    fn send_monitoring_event(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.monitoring_tx {
            match tx.try_send(event) {
                Ok(()) => trace!("Sent monitoring event"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Monitoring channel full, dropping event")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Consumes a single partition
pub struct ShardConsumer<P, R, S> {
    partition_id: String,
    ctx: ConsumerContext<P, R, S>,
    status: Arc<RwLock<ConsumerStatus>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P, R, S> ShardConsumer<P, R, S>
where
    P: RecordProcessor + 'static,
    R: RecordSource + 'static,
    S: CheckpointStore + 'static,
{
    pub fn new(partition_id: impl Into<String>, ctx: ConsumerContext<P, R, S>) -> Self {
        let partition_id = partition_id.into();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            status: Arc::new(RwLock::new(ConsumerStatus::new(partition_id.clone()))),
            partition_id,
            ctx,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> ConsumerState {
        self.status.read().state
    }

    /// Load the checkpoint and start polling.
    ///
    /// A consumer starts at most once; a second call fails with
    /// [`ConsumerError::AlreadyRunning`].
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() || self.state() != ConsumerState::Idle {
            return Err(ConsumerError::AlreadyRunning(self.partition_id.clone()));
        }

        let checkpoint = match self.ctx.store.get_checkpoint(&self.partition_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(
                    partition_id = %self.partition_id,
                    error = %e,
                    "Failed to retrieve checkpoint"
                );
                let err = ConsumerError::CheckpointRead {
                    partition_id: self.partition_id.clone(),
                    message: e.to_string(),
                };
                {
                    let mut status = self.status.write();
                    status.state = ConsumerState::Stopped;
                    status.exit = Some(ConsumerExit::CheckpointFailed(err.to_string()));
                }
                self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
                    self.partition_id.clone(),
                    PartitionEventType::Halted,
                    Some(err.to_string()),
                ));
                return Err(err);
            }
        };

        match checkpoint {
            Some(offset) => info!(
                partition_id = %self.partition_id,
                checkpoint = offset,
                "Resuming from checkpoint"
            ),
            None => info!(
                partition_id = %self.partition_id,
                "No checkpoint found, starting from the earliest record"
            ),
        }

        {
            let mut status = self.status.write();
            status.checkpoint = checkpoint;
            status.state = ConsumerState::Polling;
        }
        self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
            self.partition_id.clone(),
            PartitionEventType::Started,
            None,
        ));

        let worker = PartitionWorker {
            partition_id: self.partition_id.clone(),
            ctx: self.ctx.clone(),
            status: self.status.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            position: checkpoint,
        };
        *task = Some(tokio::spawn(worker.run()));

        Ok(())
    }

    /// Ask the task to stop without waiting for it
    pub fn request_stop(&self) {
        self.shutdown_tx.send_replace(true);
        let mut status = self.status.write();
        if status.state == ConsumerState::Polling {
            status.state = ConsumerState::Stopping;
        }
    }

    /// Stop the consumer and wait for it to drain.
    ///
    /// Waits are cancelled promptly, a delivery already in progress runs to
    /// completion and its checkpoint is written. Calling `stop` again, or
    /// concurrently, is a no-op once the consumer has stopped.
    pub async fn stop(&self) -> Result<()> {
        self.request_stop();

        let mut task = self.task.lock().await;
        match task.as_mut() {
            Some(handle) => {
                let joined = handle.await;
                *task = None;
                if let Err(e) = joined {
                    let mut status = self.status.write();
                    status.state = ConsumerState::Stopped;
                    if e.is_panic() {
                        status.exit = Some(ConsumerExit::Halted("Consumer task panicked".to_string()));
                        error!(partition_id = %self.partition_id, "Consumer task panicked");
                        return Err(e.into());
                    }
                    status.exit.get_or_insert(ConsumerExit::Aborted);
                }
            }
            None => {
                let mut status = self.status.write();
                if status.state != ConsumerState::Stopped {
                    status.state = ConsumerState::Stopped;
                    status.exit.get_or_insert(ConsumerExit::Stopped);
                }
            }
        }

        Ok(())
    }

    /// Force-stop the task without waiting for the in-flight delivery
    pub async fn abort(&self) {
        self.request_stop();
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }

        let mut status = self.status.write();
        if status.state != ConsumerState::Stopped {
            warn!(partition_id = %self.partition_id, "Force-stopping consumer");
            status.state = ConsumerState::Stopped;
            status.exit = Some(ConsumerExit::Aborted);
        }
    }
}

/// Outcome of one delivery, after retries
enum Delivery {
    Acknowledged,
    Poisoned(ProcessingError),
    Interrupted,
}

enum BatchOutcome {
    Progressed,
    /// Every record was at or before the checkpoint
    Stale,
    Exit(ConsumerExit),
}

/// State owned by the spawned task
struct PartitionWorker<P, R, S> {
    partition_id: String,
    ctx: ConsumerContext<P, R, S>,
    status: Arc<RwLock<ConsumerStatus>>,
    shutdown_rx: watch::Receiver<bool>,
    /// Offset of the last checkpointed record
    position: Option<u64>,
}

impl<P, R, S> PartitionWorker<P, R, S>
where
    P: RecordProcessor + 'static,
    R: RecordSource + 'static,
    S: CheckpointStore + 'static,
{
    async fn run(mut self) {
        let outcome = self.poll_loop().await;

        let (exit, event) = match outcome {
            Ok(ConsumerExit::Closed) => {
                info!(partition_id = %self.partition_id, "Partition closed, consumer finished");
                (ConsumerExit::Closed, PartitionEventType::Closed)
            }
            Ok(exit) => {
                info!(
                    partition_id = %self.partition_id,
                    checkpoint = ?self.position,
                    "Consumer stopped"
                );
                (exit, PartitionEventType::Stopped)
            }
            Err(e) => {
                error!(partition_id = %self.partition_id, error = %e, "Consumer halted");
                let exit = if e.is_checkpoint_failure() {
                    ConsumerExit::CheckpointFailed(e.to_string())
                } else {
                    ConsumerExit::Halted(e.to_string())
                };
                (exit, PartitionEventType::Halted)
            }
        };

        let details = match &exit {
            ConsumerExit::Halted(reason) | ConsumerExit::CheckpointFailed(reason) => {
                Some(reason.clone())
            }
            _ => None,
        };
        {
            let mut status = self.status.write();
            status.state = ConsumerState::Stopped;
            status.exit = Some(exit);
        }
        self.ctx.send_monitoring_event(ProcessingEvent::partition_event(
            self.partition_id.clone(),
            event,
            details,
        ));
    }

    async fn poll_loop(&mut self) -> Result<ConsumerExit> {
        let config = self.ctx.config.clone();
        let poll_backoff = config.poll_backoff();
        let mut empty_polls: u32 = 0;
        let mut source_failures: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(ConsumerExit::Stopped);
            }

            let polled = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown_rx) => {
                    debug!(partition_id = %self.partition_id, "Shutdown received while polling");
                    return Ok(ConsumerExit::Stopped);
                }
                polled = self.ctx.source.poll(
                    &config.stream_name,
                    &self.partition_id,
                    self.position,
                    config.batch_size,
                ) => polled,
            };

            match polled {
                Ok(records) if records.is_empty() => {
                    source_failures = 0;
                    let delay = poll_backoff.next_delay(empty_polls);
                    empty_polls = empty_polls.saturating_add(1);
                    trace!(
                        partition_id = %self.partition_id,
                        delay_ms = ?delay.as_millis(),
                        "No new records"
                    );
                    if !sleep_or_shutdown(delay, &mut self.shutdown_rx).await {
                        return Ok(ConsumerExit::Stopped);
                    }
                }
                Ok(records) => {
                    source_failures = 0;
                    match self.process_batch(records).await? {
                        BatchOutcome::Exit(exit) => return Ok(exit),
                        BatchOutcome::Progressed => empty_polls = 0,
                        BatchOutcome::Stale => {
                            let delay = poll_backoff.next_delay(empty_polls);
                            empty_polls = empty_polls.saturating_add(1);
                            debug!(
                                partition_id = %self.partition_id,
                                delay_ms = ?delay.as_millis(),
                                "Batch held only checkpointed records"
                            );
                            if !sleep_or_shutdown(delay, &mut self.shutdown_rx).await {
                                return Ok(ConsumerExit::Stopped);
                            }
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    let err = ConsumerError::TransientSource {
                        partition_id: self.partition_id.clone(),
                        message: e.to_string(),
                    };
                    let delay = poll_backoff.next_delay(source_failures);
                    source_failures = source_failures.saturating_add(1);
                    warn!(
                        error = %err,
                        attempt = source_failures,
                        delay_ms = ?delay.as_millis(),
                        "Poll failed, will retry"
                    );
                    self.ctx.send_monitoring_event(ProcessingEvent::source_error(
                        self.partition_id.clone(),
                        e.to_string(),
                        true,
                    ));
                    if !sleep_or_shutdown(delay, &mut self.shutdown_rx).await {
                        return Ok(ConsumerExit::Stopped);
                    }
                }
                Err(e) => {
                    // PartitionNotFound / StreamNotFound: nothing left to read
                    info!(partition_id = %self.partition_id, error = %e, "Partition is gone");
                    self.ctx.send_monitoring_event(ProcessingEvent::source_error(
                        self.partition_id.clone(),
                        e.to_string(),
                        false,
                    ));
                    return Ok(ConsumerExit::Closed);
                }
            }
        }
    }

    /// Deliver a batch in offset order.
    async fn process_batch(&mut self, records: Vec<Record>) -> Result<BatchOutcome> {
        let batch_start = Instant::now();
        let mut delivered = 0;
        let mut skipped = 0;
        let mut exit = None;

        for record in &records {
            let offset = record.offset();
            if matches!(self.position, Some(position) if offset <= position) {
                debug!(
                    partition_id = %self.partition_id,
                    offset = offset,
                    checkpoint = ?self.position,
                    "Skipping record at or before checkpoint"
                );
                continue;
            }

            if *self.shutdown_rx.borrow() {
                exit = Some(ConsumerExit::Stopped);
                break;
            }

            match self.deliver(record).await {
                Delivery::Acknowledged => {
                    self.commit(offset).await?;
                    self.ctx.send_monitoring_event(ProcessingEvent::record_delivered(
                        self.partition_id.clone(),
                        offset,
                    ));
                    delivered += 1;
                }
                Delivery::Poisoned(cause) => match self.ctx.config.poison_policy {
                    PoisonRecordPolicy::Skip => {
                        let err = ConsumerError::Processor {
                            partition_id: self.partition_id.clone(),
                            offset,
                            message: cause.to_string(),
                        };
                        warn!(error = %err, "Skipping poison record");
                        self.ctx.send_monitoring_event(ProcessingEvent::record_skipped(
                            self.partition_id.clone(),
                            offset,
                            cause.to_string(),
                        ));
                        self.commit(offset).await?;
                        skipped += 1;
                    }
                    PoisonRecordPolicy::Halt => {
                        return Err(ConsumerError::FatalPartition {
                            partition_id: self.partition_id.clone(),
                            offset,
                            message: cause.to_string(),
                        });
                    }
                },
                Delivery::Interrupted => {
                    debug!(
                        partition_id = %self.partition_id,
                        offset = offset,
                        "Shutdown during retry backoff, record left for redelivery"
                    );
                    exit = Some(ConsumerExit::Stopped);
                    break;
                }
            }
        }

        self.ctx.send_monitoring_event(ProcessingEvent::batch_complete(
            self.partition_id.clone(),
            delivered,
            skipped,
            batch_start.elapsed(),
        ));

        Ok(match exit {
            Some(exit) => BatchOutcome::Exit(exit),
            None if delivered + skipped == 0 => BatchOutcome::Stale,
            None => BatchOutcome::Progressed,
        })
    }

    /// Run the processor on one record, retrying failed attempts.
    ///
    /// An attempt in progress is never cancelled by shutdown; only the
    /// backoff between attempts is.
    async fn deliver(&mut self, record: &Record) -> Delivery {
        let config = self.ctx.config.clone();
        let max_attempts = config.max_retries.saturating_add(1);
        let backoff = config.retry_backoff();
        let offset = record.offset();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let attempt_start = Instant::now();

            let result = match config.processing_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.ctx.processor.process_record(record))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ProcessingError::soft(ConsumerError::ProcessingTimeout(limit))),
                    }
                }
                None => self.ctx.processor.process_record(record).await,
            };

            match result {
                Ok(()) => {
                    self.ctx.send_monitoring_event(ProcessingEvent::record_attempt(
                        self.partition_id.clone(),
                        offset,
                        true,
                        attempt,
                        attempt_start.elapsed(),
                        None,
                        false,
                    ));
                    trace!(
                        partition_id = %self.partition_id,
                        offset = offset,
                        attempt = attempt,
                        "Record acknowledged"
                    );
                    return Delivery::Acknowledged;
                }
                Err(e) => {
                    let is_final = e.is_hard() || attempt >= max_attempts;

                    if is_final || config.monitoring.include_retry_details {
                        self.ctx.send_monitoring_event(ProcessingEvent::record_attempt(
                            self.partition_id.clone(),
                            offset,
                            false,
                            attempt,
                            attempt_start.elapsed(),
                            Some(e.to_string()),
                            is_final,
                        ));
                    }

                    if is_final {
                        warn!(
                            partition_id = %self.partition_id,
                            offset = offset,
                            attempts = attempt,
                            error = %e,
                            "Record failed on its final attempt"
                        );
                        return Delivery::Poisoned(e);
                    }

                    let delay = backoff.next_delay(attempt - 1);
                    warn!(
                        partition_id = %self.partition_id,
                        offset = offset,
                        attempt = attempt,
                        delay_ms = ?delay.as_millis(),
                        error = %e,
                        "Processing failed, will retry"
                    );

                    if !sleep_or_shutdown(delay, &mut self.shutdown_rx).await {
                        return Delivery::Interrupted;
                    }
                }
            }
        }
    }

    /// Persist `offset` as the partition's checkpoint
    async fn commit(&mut self, offset: u64) -> Result<()> {
        match self.ctx.store.save_checkpoint(&self.partition_id, offset).await {
            Ok(()) => {
                self.position = Some(offset);
                self.status.write().checkpoint = Some(offset);
                self.ctx.send_monitoring_event(ProcessingEvent::checkpoint(
                    self.partition_id.clone(),
                    offset,
                    true,
                    None,
                ));
                debug!(partition_id = %self.partition_id, offset = offset, "Checkpoint saved");
                Ok(())
            }
            Err(e) => {
                self.ctx.send_monitoring_event(ProcessingEvent::checkpoint(
                    self.partition_id.clone(),
                    offset,
                    false,
                    Some(e.to_string()),
                ));
                Err(ConsumerError::CheckpointWrite {
                    partition_id: self.partition_id.clone(),
                    offset,
                    message: e.to_string(),
                })
            }
        }
    }
}
