use anyhow::Result;
use kinesis_listener::monitoring::MetricsAggregator;
use kinesis_listener::retry::wait_until;
use kinesis_listener::{
    CheckpointStore, ConsumerConfig, ConsumerGroup, FileCheckpointStore, InMemoryCheckpointStore,
    InMemoryRecordSource, MessageListener,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

mod common;

use common::{create_test_config, init_logging, CollectingHandler, PartitionRecorder, STREAM_NAME};

#[tokio::test]
async fn test_hello_message_delivered() -> Result<()> {
    init_logging();
    let source = InMemoryRecordSource::with_partitions(STREAM_NAME, 1).await;
    let handler = CollectingHandler::default();
    let store = InMemoryCheckpointStore::new();

    let (group, _) = ConsumerGroup::new(
        create_test_config(),
        MessageListener::new(handler.clone()),
        source.clone(),
        store.clone(),
    )?;
    group.start().await?;

    source.append("shard-0", "Hello").await?;

    let messages = handler.wait_for(1, Duration::from_secs(5)).await?;
    assert_eq!(messages, vec!["Hello"]);

    let report = group.stop().await;
    assert!(report.is_clean());
    assert_eq!(store.get_checkpoint("shard-0").await?, Some(0));
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_from_file_checkpoint() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let source = InMemoryRecordSource::with_partitions(STREAM_NAME, 1).await;
    for message in ["one", "two", "three"] {
        source.append("shard-0", message).await?;
    }

    let first = CollectingHandler::default();
    let (group, _) = ConsumerGroup::new(
        create_test_config(),
        MessageListener::new(first.clone()),
        source.clone(),
        FileCheckpointStore::new(dir.path()),
    )?;
    group.start().await?;
    first.wait_for(3, Duration::from_secs(5)).await?;
    assert!(group.stop().await.is_clean());

    source.append("shard-0", "four").await?;
    source.append("shard-0", "five").await?;

    let second = CollectingHandler::default();
    let (group, _) = ConsumerGroup::new(
        create_test_config(),
        MessageListener::new(second.clone()),
        source.clone(),
        FileCheckpointStore::new(dir.path()),
    )?;
    group.start().await?;
    let messages = second.wait_for(2, Duration::from_secs(5)).await?;
    assert!(group.stop().await.is_clean());

    assert_eq!(first.messages().await, vec!["one", "two", "three"]);
    assert_eq!(messages, vec!["four", "five"]);

    let store = FileCheckpointStore::new(dir.path());
    assert_eq!(store.get_checkpoint("shard-0").await?, Some(4));
    Ok(())
}

#[tokio::test]
async fn test_partitions_are_isolated() -> Result<()> {
    init_logging();
    let source = InMemoryRecordSource::with_partitions(STREAM_NAME, 3).await;
    let recorder = PartitionRecorder::with_slow_partition("shard-0", Duration::from_millis(300));

    for i in 0..3 {
        source.append("shard-0", format!("slow-{}", i)).await?;
    }
    for partition in ["shard-1", "shard-2"] {
        for i in 0..10 {
            source.append(partition, format!("{}-{}", partition, i)).await?;
        }
    }

    let (group, _) = ConsumerGroup::new(
        create_test_config(),
        recorder.clone(),
        source.clone(),
        InMemoryCheckpointStore::new(),
    )?;
    group.start().await?;

    let fast = recorder.clone();
    wait_until(
        move || {
            let fast = fast.clone();
            async move {
                fast.delivered("shard-1").await.len() == 10
                    && fast.delivered("shard-2").await.len() == 10
            }
        },
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await?;
    assert!(recorder.delivered("shard-0").await.len() < 3);

    let slow = recorder.clone();
    wait_until(
        move || {
            let slow = slow.clone();
            async move { slow.delivered("shard-0").await.len() == 3 }
        },
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await?;

    assert!(group.stop().await.is_clean());

    assert_eq!(
        recorder.delivered("shard-0").await,
        vec!["slow-0", "slow-1", "slow-2"]
    );
    let expected: Vec<String> = (0..10).map(|i| format!("shard-1-{}", i)).collect();
    assert_eq!(recorder.delivered("shard-1").await, expected);
    Ok(())
}

#[tokio::test]
async fn test_invalid_payload_skipped() -> Result<()> {
    init_logging();
    let source = InMemoryRecordSource::with_partitions(STREAM_NAME, 1).await;
    let handler = CollectingHandler::default();
    let store = InMemoryCheckpointStore::new();

    source.append("shard-0", vec![0xff, 0xfe, 0xfd]).await?;
    source.append("shard-0", "after").await?;

    let (group, _) = ConsumerGroup::new(
        create_test_config(),
        MessageListener::new(handler.clone()),
        source,
        store.clone(),
    )?;
    group.start().await?;

    let messages = handler.wait_for(1, Duration::from_secs(5)).await?;
    assert_eq!(messages, vec!["after"]);

    assert!(group.stop().await.is_clean());
    assert_eq!(store.get_checkpoint("shard-0").await?, Some(1));
    Ok(())
}

#[tokio::test]
async fn test_metrics_from_monitoring_events() -> Result<()> {
    init_logging();
    let mut config = create_test_config();
    config.monitoring.enabled = true;
    config.monitoring.metrics_interval = Duration::from_secs(60);
    let monitoring_config = config.monitoring.clone();

    let source = InMemoryRecordSource::with_partitions(STREAM_NAME, 2).await;
    let handler = CollectingHandler::default();
    for i in 0..5 {
        source.append("shard-1", format!("m-{}", i)).await?;
    }

    let (group, monitoring_rx) = ConsumerGroup::new(
        config,
        MessageListener::new(handler.clone()),
        source,
        InMemoryCheckpointStore::new(),
    )?;
    let aggregator = MetricsAggregator::from_config(
        &monitoring_config,
        monitoring_rx.expect("monitoring enabled"),
    );
    let metrics = aggregator.handle();
    let aggregator_task = tokio::spawn(aggregator.run());

    group.start().await?;
    handler.wait_for(5, Duration::from_secs(5)).await?;
    assert!(group.stop().await.is_clean());

    // the last sender goes away with the group
    drop(group);
    tokio::time::timeout(Duration::from_secs(5), aggregator_task).await??;

    let metrics = metrics.read().await;
    let partition = metrics.get("shard-1").expect("metrics for shard-1");
    assert_eq!(partition.records_delivered, 5);
    assert_eq!(partition.checkpoints_succeeded, 5);
    assert_eq!(partition.last_checkpoint, Some(4));
    assert!(!partition.halted);
    Ok(())
}

#[tokio::test]
async fn test_config_from_invalid_settings_rejected() {
    let config = ConsumerConfig {
        batch_size: 0,
        ..create_test_config()
    };
    let result = ConsumerGroup::new(
        config,
        MessageListener::new(CollectingHandler::default()),
        InMemoryRecordSource::new(STREAM_NAME),
        InMemoryCheckpointStore::new(),
    );
    assert!(result.is_err());
}
