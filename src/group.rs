//! Consumer group: one shard consumer per partition of a stream

use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConsumerConfig;
use crate::consumer::{ConsumerContext, ConsumerState, ConsumerStatus, ShardConsumer};
use crate::error::{ConsumerError, Result};
use crate::monitoring::ProcessingEvent;
use crate::processor::RecordProcessor;
use crate::retry::{sleep_or_shutdown, wait_for_shutdown, wait_until};
use crate::source::RecordSource;
use crate::store::CheckpointStore;

/// Partitions touched by one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Consumers started (new partitions and restarted ones)
    pub started: Vec<String>,
    /// Consumers stopped because their partition disappeared
    pub removed: Vec<String>,
    /// Partitions whose consumer could not be started
    pub failed: Vec<String>,
}

/// Outcome of [`ConsumerGroup::stop`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Partitions that drained within the shutdown timeout
    pub drained: Vec<String>,
    /// Partitions force-stopped when the shutdown timeout expired
    pub undrained: Vec<String>,
    /// Partitions that ended unhealthy, with the reason
    pub unhealthy: Vec<(String, String)>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.undrained.is_empty() && self.unhealthy.is_empty()
    }
}

type Consumers<P, R, S> = HashMap<String, Arc<ShardConsumer<P, R, S>>>;

struct GroupInner<P, R, S> {
    ctx: ConsumerContext<P, R, S>,
    consumers: Mutex<Consumers<P, R, S>>,
    /// Consumers of removed partitions that have not finished draining.
    /// Only changed while `consumers` is locked.
    draining: parking_lot::Mutex<Vec<Arc<ShardConsumer<P, R, S>>>>,
}

impl<P, R, S> GroupInner<P, R, S>
where
    P: RecordProcessor + 'static,
    R: RecordSource + 'static,
    S: CheckpointStore + 'static,
{
    async fn reconcile(&self) -> Result<ReconcileReport> {
        let stream = &self.ctx.config().stream_name;
        let partitions: BTreeSet<String> = self
            .ctx
            .list_partitions()
            .await
            .map_err(|e| ConsumerError::Discovery(format!("{}: {}", stream, e)))?
            .into_iter()
            .collect();

        debug!(stream = %stream, partitions = ?partitions, "Discovered partitions");

        let mut report = ReconcileReport::default();
        let removed = {
            let mut consumers = self.consumers.lock().await;

            let gone: Vec<String> = consumers
                .keys()
                .filter(|id| !partitions.contains(*id))
                .cloned()
                .collect();
            let mut removed = Vec::with_capacity(gone.len());
            for partition_id in gone {
                if let Some(consumer) = consumers.remove(&partition_id) {
                    info!(partition_id = %partition_id, "Partition removed, stopping consumer");
                    consumer.request_stop();
                    self.draining.lock().push(consumer.clone());
                    removed.push(consumer);
                    report.removed.push(partition_id);
                }
            }

            for partition_id in partitions {
                if let Some(existing) = consumers.get(&partition_id) {
                    let status = existing.status();
                    if !status.is_restartable() {
                        continue;
                    }
                    info!(
                        partition_id = %partition_id,
                        exit = ?status.exit,
                        "Restarting consumer"
                    );
                    if let Err(e) = existing.stop().await {
                        warn!(partition_id = %partition_id, error = %e, "Error stopping consumer");
                    }
                }

                // registered before starting, so a cancelled reconcile never
                // leaves a running consumer outside the map
                let consumer = Arc::new(ShardConsumer::new(partition_id.clone(), self.ctx.clone()));
                consumers.insert(partition_id.clone(), consumer.clone());
                match consumer.start().await {
                    Ok(()) => report.started.push(partition_id),
                    Err(e) => {
                        error!(partition_id = %partition_id, error = %e, "Failed to start consumer");
                        report.failed.push(partition_id);
                    }
                }
            }

            removed
        };

        join_all(removed.iter().map(|consumer| self.drain_removed(consumer))).await;

        Ok(report)
    }

    async fn drain_removed(&self, consumer: &Arc<ShardConsumer<P, R, S>>) {
        if let Err(e) = consumer.stop().await {
            warn!(
                partition_id = %consumer.partition_id(),
                error = %e,
                "Error stopping consumer"
            );
        }
        let _consumers = self.consumers.lock().await;
        self.draining
            .lock()
            .retain(|draining| !Arc::ptr_eq(draining, consumer));
    }

    /// Empty the group, returning every consumer it still owns
    async fn take_all(&self) -> Vec<Arc<ShardConsumer<P, R, S>>> {
        let mut consumers = self.consumers.lock().await;
        let mut all: Vec<_> = consumers.drain().map(|(_, consumer)| consumer).collect();
        all.extend(self.draining.lock().drain(..));
        all
    }
}

struct RefreshTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs one [`ShardConsumer`] per partition of a stream.
///
/// Partitions are consumed independently: a slow or halted partition never
/// delays another one.
pub struct ConsumerGroup<P, R, S> {
    inner: Arc<GroupInner<P, R, S>>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl<P, R, S> ConsumerGroup<P, R, S>
where
    P: RecordProcessor + 'static,
    R: RecordSource + 'static,
    S: CheckpointStore + 'static,
{
    /// Creates a new consumer group
    ///
    /// # Arguments
    ///
    /// * `config` - Consumer configuration, validated here
    /// * `processor` - Record processor shared by every partition
    /// * `source` - Record source to poll
    /// * `store` - Checkpoint storage implementation
    ///
    /// # Returns
    ///
    /// Returns the group and, when monitoring is enabled, the receiving end
    /// of the monitoring channel
    pub fn new(
        config: ConsumerConfig,
        processor: P,
        source: R,
        store: S,
    ) -> Result<(Self, Option<mpsc::Receiver<ProcessingEvent>>)> {
        config.validate()?;

        let (monitoring_tx, monitoring_rx) = if config.monitoring.enabled {
            let (tx, rx) = mpsc::channel(config.monitoring.channel_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let ctx = ConsumerContext::new(
            config,
            Arc::new(processor),
            Arc::new(source),
            Arc::new(store),
            monitoring_tx,
        );

        let group = Self {
            inner: Arc::new(GroupInner {
                ctx,
                consumers: Mutex::new(HashMap::new()),
                draining: parking_lot::Mutex::new(Vec::new()),
            }),
            refresh: Mutex::new(None),
        };

        Ok((group, monitoring_rx))
    }

    pub fn config(&self) -> &ConsumerConfig {
        self.inner.ctx.config()
    }

    /// Discover partitions and start a consumer for each one.
    ///
    /// Fails with [`ConsumerError::Discovery`] when the partitions cannot be
    /// listed; no consumer is started in that case. Starts the periodic
    /// partition refresh when one is configured.
    #[instrument(skip(self), fields(stream = %self.config().stream_name))]
    pub async fn start(&self) -> Result<ReconcileReport> {
        info!("Starting consumer group");
        let report = self.inner.reconcile().await?;
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Consumer group started"
        );

        if let Some(interval) = self.config().partition_refresh_interval {
            let mut refresh = self.refresh.lock().await;
            if refresh.is_none() {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn(refresh_loop(self.inner.clone(), interval, shutdown_rx));
                *refresh = Some(RefreshTask {
                    shutdown_tx,
                    handle,
                });
            }
        }

        Ok(report)
    }

    /// Re-discover partitions once.
    ///
    /// Starts consumers for new partitions, drains consumers whose partition
    /// is gone, and replaces consumers that stopped on a checkpoint failure.
    /// Partitions halted by a poison record stay halted.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().await
    }

    /// Stop every consumer and wait for them to drain.
    ///
    /// Consumers still running after `shutdown_timeout` are force-stopped and
    /// listed in [`StopReport::undrained`]. The timeout bounds the whole call,
    /// including consumers of removed partitions that are still draining.
    /// Calling `stop` twice is harmless.
    #[instrument(skip(self), fields(stream = %self.config().stream_name))]
    pub async fn stop(&self) -> StopReport {
        let timeout = self.config().shutdown_timeout;
        let deadline = Instant::now() + timeout;

        if let Some(mut refresh) = self.refresh.lock().await.take() {
            refresh.shutdown_tx.send_replace(true);
            match tokio::time::timeout_at(deadline, &mut refresh.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Partition refresh task failed"),
                Err(_) => {
                    warn!("Partition refresh did not stop in time, aborting it");
                    refresh.handle.abort();
                    // releases whatever the cancelled reconcile held
                    let _ = refresh.handle.await;
                }
            }
        }

        let consumers = self.inner.take_all().await;

        info!(partitions = consumers.len(), "Stopping consumer group");

        for consumer in &consumers {
            consumer.request_stop();
        }

        let drain = join_all(consumers.iter().map(|consumer| consumer.stop()));
        match tokio::time::timeout_at(deadline, drain).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Consumer stopped with error");
                    }
                }
            }
            Err(_) => warn!(timeout = ?timeout, "Shutdown timeout expired, force-stopping"),
        }

        let mut report = StopReport::default();
        for consumer in consumers {
            let partition_id = consumer.partition_id().to_string();
            if consumer.state() == ConsumerState::Stopped {
                report.drained.push(partition_id.clone());
            } else {
                consumer.abort().await;
                report.undrained.push(partition_id.clone());
            }
            if let Some(reason) = consumer.status().failure() {
                report.unhealthy.push((partition_id, reason));
            }
        }

        report.drained.sort();
        report.undrained.sort();
        report.unhealthy.sort();

        if report.is_clean() {
            info!(drained = report.drained.len(), "Consumer group stopped");
        } else {
            warn!(
                undrained = ?report.undrained,
                unhealthy = ?report.unhealthy,
                "Consumer group stopped with problems"
            );
        }

        report
    }

    /// Status of every partition, ordered by partition id
    pub async fn statuses(&self) -> Vec<ConsumerStatus> {
        let consumers = self.inner.consumers.lock().await;
        let mut statuses: Vec<ConsumerStatus> =
            consumers.values().map(|consumer| consumer.status()).collect();
        statuses.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        statuses
    }

    pub async fn partition_status(&self, partition_id: &str) -> Option<ConsumerStatus> {
        self.inner
            .consumers
            .lock()
            .await
            .get(partition_id)
            .map(|consumer| consumer.status())
    }

    /// Partitions that halted, failed a checkpoint or were force-stopped
    pub async fn unhealthy_partitions(&self) -> Vec<(String, String)> {
        self.statuses()
            .await
            .into_iter()
            .filter_map(|status| status.failure().map(|reason| (status.partition_id, reason)))
            .collect()
    }

    /// Wait until every known partition is polling
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let group = self;
        wait_until(
            move || async move {
                let statuses = group.statuses().await;
                !statuses.is_empty()
                    && statuses
                        .iter()
                        .all(|status| status.state == ConsumerState::Polling)
            },
            Duration::from_millis(10),
            timeout,
        )
        .await
        .map_err(ConsumerError::from)
    }
}

async fn refresh_loop<P, R, S>(
    inner: Arc<GroupInner<P, R, S>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    P: RecordProcessor + 'static,
    R: RecordSource + 'static,
    S: CheckpointStore + 'static,
{
    debug!(interval = ?interval, "Partition refresh started");
    while sleep_or_shutdown(interval, &mut shutdown_rx).await {
        // consumers still draining stay in the group for `stop` to collect
        let reconciled = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            reconciled = inner.reconcile() => reconciled,
        };
        match reconciled {
            Ok(report) if !report.started.is_empty() || !report.removed.is_empty() => {
                info!(
                    started = ?report.started,
                    removed = ?report.removed,
                    "Partition set changed"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Partition refresh failed"),
        }
    }
    debug!("Partition refresh stopped");
}
