//! DynamoDB-backed checkpoint storage.
//!
//! One item per partition, keyed by `partition_id`. Saves are conditional
//! puts that refuse to lower a stored offset.

use crate::retry::{RetryConfig, RetryHandle};
use crate::store::CheckpointStore;
use crate::ExponentialBackoff;
use anyhow::Context;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

const KEY_ATTRIBUTE: &str = "partition_id";
const OFFSET_ATTRIBUTE: &str = "checkpoint_offset";
const UPDATED_AT_ATTRIBUTE: &str = "updated_at";

/// Connection settings for the checkpoint table.
///
/// `endpoint_url` points the client at a local emulator; static credentials
/// replace the ambient AWS credential chain.
#[derive(Debug, Clone)]
pub struct DynamoDbSettings {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub table_name: String,
    pub key_prefix: String,
}

impl Default for DynamoDbSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            table_name: "kinesis-listener-checkpoints".to_string(),
            key_prefix: String::new(),
        }
    }
}

impl DynamoDbSettings {
    /// Build a DynamoDB client from these settings
    pub fn client(&self) -> DynamoClient {
        let mut builder = aws_sdk_dynamodb::config::Builder::new()
            .region(aws_config::Region::new(self.region.clone()));

        if let (Some(key), Some(secret)) = (&self.access_key_id, &self.secret_access_key) {
            builder = builder.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "kinesis-listener-static",
            ));
        }

        if let Some(endpoint) = &self.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone());
        }

        DynamoClient::from_conf(builder.build())
    }
}

#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::new()
    }

    pub fn from_settings(settings: &DynamoDbSettings) -> Self {
        Self {
            client: settings.client(),
            table_name: settings.table_name.clone(),
            key_prefix: settings.key_prefix.clone(),
            retry_config: RetryConfig::default(),
            backoff: default_backoff(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn prefixed_key(&self, partition_id: &str) -> String {
        format!("{}{}", self.key_prefix, partition_id)
    }

    /// Create the checkpoint table if it does not exist yet
    pub async fn ensure_table(&self) -> anyhow::Result<()> {
        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(KEY_ATTRIBUTE)
                    .key_type(KeyType::Hash)
                    .build()?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(KEY_ATTRIBUTE)
                    .attribute_type(ScalarAttributeType::S)
                    .build()?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %self.table_name, "Created checkpoint table");
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_resource_in_use_exception() {
                    debug!(table = %self.table_name, "Checkpoint table already exists");
                    Ok(())
                } else {
                    Err(anyhow::Error::new(service_error)
                        .context(format!("Failed to create table {}", self.table_name)))
                }
            }
        }
    }
}

fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(30))
        .build()
}

fn parse_offset(attr: &AttributeValue) -> anyhow::Result<u64> {
    let raw = attr
        .as_n()
        .map_err(|_| anyhow::anyhow!("{} is not a number attribute", OFFSET_ATTRIBUTE))?;
    raw.parse::<u64>()
        .with_context(|| format!("Invalid checkpoint offset {:?}", raw))
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn get_checkpoint(&self, partition_id: &str) -> anyhow::Result<Option<u64>> {
        let key = self.prefixed_key(partition_id);
        let mut retry = RetryHandle::new(self.retry_config.clone(), self.backoff.clone());
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        trace!(partition_id = %partition_id, key = %key, "Getting checkpoint from DynamoDB");

        let item = retry
            .retry(
                || {
                    let key = key.clone();
                    async move {
                        self.client
                            .get_item()
                            .table_name(&self.table_name)
                            .key(KEY_ATTRIBUTE, AttributeValue::S(key))
                            .consistent_read(true)
                            .send()
                            .await
                            .context("Failed to get checkpoint from DynamoDB")
                            .map(|response| response.item)
                    }
                },
                &mut shutdown_rx,
            )
            .await?;

        let checkpoint = match item.as_ref().and_then(|item| item.get(OFFSET_ATTRIBUTE)) {
            Some(attr) => Some(parse_offset(attr)?),
            None => None,
        };

        debug!(
            partition_id = %partition_id,
            key = %key,
            checkpoint = ?checkpoint,
            "Retrieved checkpoint from DynamoDB"
        );

        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn save_checkpoint(&self, partition_id: &str, offset: u64) -> anyhow::Result<()> {
        let key = self.prefixed_key(partition_id);
        let mut retry = RetryHandle::new(self.retry_config.clone(), self.backoff.clone());
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        debug!(
            partition_id = %partition_id,
            key = %key,
            offset = offset,
            "Saving checkpoint to DynamoDB"
        );

        let written = retry
            .retry(
                || {
                    let key = key.clone();
                    async move {
                        let result = self
                            .client
                            .put_item()
                            .table_name(&self.table_name)
                            .item(KEY_ATTRIBUTE, AttributeValue::S(key))
                            .item(OFFSET_ATTRIBUTE, AttributeValue::N(offset.to_string()))
                            .item(
                                UPDATED_AT_ATTRIBUTE,
                                AttributeValue::S(chrono::Utc::now().to_rfc3339()),
                            )
                            .condition_expression("attribute_not_exists(#offset) OR #offset <= :offset")
                            .expression_attribute_names("#offset", OFFSET_ATTRIBUTE)
                            .expression_attribute_values(":offset", AttributeValue::N(offset.to_string()))
                            .send()
                            .await;

                        match result {
                            Ok(_) => Ok(true),
                            Err(e) => {
                                let service_error = e.into_service_error();
                                if service_error.is_conditional_check_failed_exception() {
                                    Ok(false)
                                } else {
                                    Err(anyhow::Error::new(service_error)
                                        .context("Failed to save checkpoint to DynamoDB"))
                                }
                            }
                        }
                    }
                },
                &mut shutdown_rx,
            )
            .await?;

        if written {
            trace!(partition_id = %partition_id, offset = offset, "Checkpoint saved to DynamoDB");
        } else {
            debug!(
                partition_id = %partition_id,
                offset = offset,
                "Stored checkpoint is already ahead, keeping it"
            );
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl Default for DynamoDbCheckpointStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            table_name: None,
            key_prefix: None,
            retry_config: RetryConfig::default(),
            backoff: default_backoff(),
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.backoff = config.backoff();
        self.retry_config = config;
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbCheckpointStore> {
        Ok(DynamoDbCheckpointStore {
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self
                .table_name
                .ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            key_prefix: self.key_prefix.unwrap_or_default(),
            retry_config: self.retry_config,
            backoff: self.backoff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> DynamoDbSettings {
        DynamoDbSettings {
            endpoint_url: Some("http://localhost:4566".to_string()),
            access_key_id: Some("some_aws_access_key_id".to_string()),
            secret_access_key: Some("some_aws_secret_access_key".to_string()),
            table_name: "kinesis-with-localstack-example".to_string(),
            key_prefix: "test-prefix-".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_from_settings() {
        let store = DynamoDbCheckpointStore::from_settings(&test_settings());
        assert_eq!(store.table_name(), "kinesis-with-localstack-example");
        assert_eq!(store.prefixed_key("shard-1"), "test-prefix-shard-1");
    }

    #[test]
    fn test_builder_requires_client_and_table() {
        assert!(DynamoDbCheckpointStore::builder().build().is_err());

        let client = test_settings().client();
        assert!(DynamoDbCheckpointStore::builder()
            .with_client(client.clone())
            .build()
            .is_err());

        let store = DynamoDbCheckpointStore::builder()
            .with_client(client)
            .with_table_name("checkpoints")
            .build()
            .expect("store");
        assert_eq!(store.prefixed_key("shard-1"), "shard-1");
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset(&AttributeValue::N("42".to_string())).unwrap(), 42);
        assert!(parse_offset(&AttributeValue::N("-1".to_string())).is_err());
        assert!(parse_offset(&AttributeValue::S("42".to_string())).is_err());
    }
}
