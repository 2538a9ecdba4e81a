//! Consumer configuration

use std::time::Duration;

use crate::error::{ConsumerError, Result};
use crate::monitoring::MonitoringConfig;
use crate::retry::ExponentialBackoff;

/// What a shard consumer does with a record that still fails after its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonRecordPolicy {
    /// Log the record, advance the checkpoint past it and keep going
    Skip,
    /// Stop the partition without advancing the checkpoint
    Halt,
}

impl std::str::FromStr for PoisonRecordPolicy {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(PoisonRecordPolicy::Skip),
            "halt" => Ok(PoisonRecordPolicy::Halt),
            other => Err(ConsumerError::Config(format!(
                "Unknown poison record policy {:?}, expected \"skip\" or \"halt\"",
                other
            ))),
        }
    }
}

/// Configuration shared by a consumer group and its shard consumers
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name of the stream to consume
    pub stream_name: String,
    /// Maximum number of records requested per poll
    pub batch_size: usize,
    /// Wait after the first empty poll; also the floor for every poll wait
    pub poll_interval_min: Duration,
    /// Cap for the wait between empty polls
    pub poll_interval_max: Duration,
    /// Retries after the first failed processor attempt, before the poison policy applies
    pub max_retries: u32,
    /// First delay between processor retries
    pub retry_backoff_initial: Duration,
    /// Cap for the delay between processor retries
    pub retry_backoff_max: Duration,
    /// What to do with a record whose retries are exhausted
    pub poison_policy: PoisonRecordPolicy,
    /// Optional limit for a single processor attempt
    pub processing_timeout: Option<Duration>,
    /// Overall time allowed for the group to drain on stop
    pub shutdown_timeout: Duration,
    /// How often the group re-discovers partitions (None disables it)
    pub partition_refresh_interval: Option<Duration>,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            batch_size: 100,
            poll_interval_min: Duration::from_millis(200),
            poll_interval_max: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff_initial: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(10),
            poison_policy: PoisonRecordPolicy::Skip,
            processing_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            partition_refresh_interval: None,
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    /// Check the configuration once, before any consumer starts
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(ConsumerError::Config("stream_name must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConsumerError::Config("batch_size must be at least 1".to_string()));
        }
        if self.poll_interval_min.is_zero() {
            return Err(ConsumerError::Config(
                "poll_interval_min must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_max < self.poll_interval_min {
            return Err(ConsumerError::Config(format!(
                "poll_interval_max ({:?}) is below poll_interval_min ({:?})",
                self.poll_interval_max, self.poll_interval_min
            )));
        }
        if self.retry_backoff_max < self.retry_backoff_initial {
            return Err(ConsumerError::Config(format!(
                "retry_backoff_max ({:?}) is below retry_backoff_initial ({:?})",
                self.retry_backoff_max, self.retry_backoff_initial
            )));
        }
        if matches!(self.processing_timeout, Some(t) if t.is_zero()) {
            return Err(ConsumerError::Config(
                "processing_timeout must be greater than zero".to_string(),
            ));
        }
        if matches!(self.partition_refresh_interval, Some(t) if t.is_zero()) {
            return Err(ConsumerError::Config(
                "partition_refresh_interval must be greater than zero".to_string(),
            ));
        }
        if self.monitoring.enabled && self.monitoring.channel_size == 0 {
            return Err(ConsumerError::Config(
                "monitoring.channel_size must be at least 1".to_string(),
            ));
        }
        if self.monitoring.enabled && self.monitoring.metrics_interval.is_zero() {
            return Err(ConsumerError::Config(
                "monitoring.metrics_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff between empty polls and after transient source errors
    pub fn poll_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.poll_interval_min)
            .max_delay(self.poll_interval_max)
            .jitter_factor(0.0)
            .build()
    }

    /// Backoff between processor retries of the same record
    pub fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.retry_backoff_initial)
            .max_delay(self.retry_backoff_max)
            .build()
    }

    /// Build a configuration from `KINESIS_*` environment variables.
    ///
    /// `KINESIS_STREAM_NAME` is required. Durations are in milliseconds:
    /// `KINESIS_POLL_INTERVAL_MIN_MS`, `KINESIS_POLL_INTERVAL_MAX_MS`,
    /// `KINESIS_RETRY_BACKOFF_INITIAL_MS`, `KINESIS_RETRY_BACKOFF_MAX_MS`,
    /// `KINESIS_PROCESSING_TIMEOUT_MS`, `KINESIS_SHUTDOWN_TIMEOUT_MS`,
    /// `KINESIS_PARTITION_REFRESH_MS`. Also `KINESIS_BATCH_SIZE`,
    /// `KINESIS_MAX_RETRIES` and `KINESIS_POISON_POLICY` (`skip` | `halt`).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = ConsumerConfig {
            stream_name: lookup("KINESIS_STREAM_NAME").ok_or_else(|| {
                ConsumerError::Config("KINESIS_STREAM_NAME is not set".to_string())
            })?,
            ..Default::default()
        };

        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|e| {
                        ConsumerError::Config(format!("{} has invalid value {:?}: {}", key, raw, e))
                    })
                })
                .transpose()
        };
        let millis = |key: &str| -> Result<Option<Duration>> {
            Ok(number(key)?.map(Duration::from_millis))
        };

        if let Some(v) = number("KINESIS_BATCH_SIZE")? {
            config.batch_size = v as usize;
        }
        if let Some(v) = number("KINESIS_MAX_RETRIES")? {
            config.max_retries = u32::try_from(v).map_err(|_| {
                ConsumerError::Config(format!("KINESIS_MAX_RETRIES is too large: {}", v))
            })?;
        }
        if let Some(v) = millis("KINESIS_POLL_INTERVAL_MIN_MS")? {
            config.poll_interval_min = v;
        }
        if let Some(v) = millis("KINESIS_POLL_INTERVAL_MAX_MS")? {
            config.poll_interval_max = v;
        }
        if let Some(v) = millis("KINESIS_RETRY_BACKOFF_INITIAL_MS")? {
            config.retry_backoff_initial = v;
        }
        if let Some(v) = millis("KINESIS_RETRY_BACKOFF_MAX_MS")? {
            config.retry_backoff_max = v;
        }
        if let Some(v) = millis("KINESIS_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = v;
        }
        config.processing_timeout = millis("KINESIS_PROCESSING_TIMEOUT_MS")?;
        config.partition_refresh_interval = millis("KINESIS_PARTITION_REFRESH_MS")?;
        if let Some(policy) = lookup("KINESIS_POISON_POLICY") {
            config.poison_policy = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}
