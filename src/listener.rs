//! Text message listener
//!
//! Decodes record payloads as UTF-8 and forwards the resulting message to a
//! [`MessageHandler`]. Payloads that are not valid UTF-8 can never succeed,
//! so they are reported as hard failures; handler errors are soft failures
//! and get retried.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ProcessingError;
use crate::processor::RecordProcessor;
use crate::record::Record;

/// Receives decoded text messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &str) -> anyhow::Result<()>;
}

/// Adapts a [`MessageHandler`] into a [`RecordProcessor`]
#[derive(Debug, Clone)]
pub struct MessageListener<H> {
    handler: H,
}

impl<H: MessageHandler> MessageListener<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: MessageHandler> RecordProcessor for MessageListener<H> {
    async fn process_record(&self, record: &Record) -> Result<(), ProcessingError> {
        let message = record.payload_str().map_err(|e| {
            warn!(
                partition_id = %record.partition_id(),
                offset = record.offset(),
                error = %e,
                "Payload is not valid UTF-8"
            );
            ProcessingError::hard(e)
        })?;

        debug!(
            partition_id = %record.partition_id(),
            offset = record.offset(),
            "Forwarding message to handler"
        );

        self.handler
            .handle_message(message)
            .await
            .map_err(ProcessingError::SoftFailure)
    }
}
