//! The record processing hook supplied by users of the crate

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ProcessingError;
use crate::record::Record;

/// Trait for implementing record processing logic
///
/// A shard consumer calls `process_record` once per delivery attempt and
/// waits for it to return before touching the next record, so calls for the
/// same partition never overlap. Calls for different partitions may run
/// concurrently.
///
/// # Examples
///
/// ```rust
/// use kinesis_listener::{ProcessingError, Record, RecordProcessor};
///
/// struct PrintProcessor;
///
/// #[async_trait::async_trait]
/// impl RecordProcessor for PrintProcessor {
///     async fn process_record(&self, record: &Record) -> Result<(), ProcessingError> {
///         let text = record.payload_str().map_err(ProcessingError::hard)?;
///         println!("{}: {}", record.offset(), text);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Process a single record
    ///
    /// # Returns
    ///
    /// * `Ok(())` acknowledges the record; its offset is checkpointed
    /// * `Err(ProcessingError::SoftFailure)` retries the record with backoff
    /// * `Err(ProcessingError::HardFailure)` skips the remaining retries and
    ///   applies the poison record policy immediately
    async fn process_record(&self, record: &Record) -> Result<(), ProcessingError>;
}

#[async_trait]
impl<T: RecordProcessor + ?Sized> RecordProcessor for Arc<T> {
    async fn process_record(&self, record: &Record) -> Result<(), ProcessingError> {
        (**self).process_record(record).await
    }
}
