use sluice_common::{Datastream, Error, ProducerRecord, SharingKey, Task, TaskPartition, TransportProvider};
use sluice_connector_memory::{MemoryCheckpointProvider, MemoryTransportProvider};
use sluice_producer::EventProducer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const DESTINATION: &str = "mem://orders-out";

fn task() -> Task {
    let mut ds = Datastream::new("orders", "kafka", "kafka://b1:9092/orders", DESTINATION);
    ds.source.partitions = Some(2);
    Task::new(&ds)
}

fn record(partition: u32, offset: i64) -> ProducerRecord {
    ProducerRecord {
        partition,
        key: None,
        value: format!("value-{offset}").into_bytes(),
        source_checkpoint: offset.to_string(),
    }
}

async fn producer(
    interval: Duration,
) -> (EventProducer, MemoryTransportProvider, MemoryCheckpointProvider) {
    let transports = MemoryTransportProvider::new();
    let checkpoints = MemoryCheckpointProvider::new();
    let transport = transports.connect(DESTINATION).await.unwrap();
    let producer = EventProducer::new(
        SharingKey::new("kafka", DESTINATION),
        transport,
        Arc::new(checkpoints.clone()),
        interval,
    );
    (producer, transports, checkpoints)
}

#[tokio::test]
async fn test_flush_timer_commits_sent_positions() {
    let (producer, transports, checkpoints) = producer(Duration::from_millis(20)).await;
    let task = task();
    producer.send(&task, record(0, 4)).await.unwrap();
    producer.send(&task, record(1, 9)).await.unwrap();
    assert!(transports.delivered(DESTINATION).is_empty());

    sleep(Duration::from_millis(150)).await;

    assert_eq!(transports.delivered(DESTINATION).len(), 2);
    let committed = checkpoints.committed();
    assert_eq!(committed[&TaskPartition::new(&task.name, 0)], "4");
    assert_eq!(committed[&TaskPartition::new(&task.name, 1)], "9");
    assert!(producer.pending_checkpoints().is_empty());
    assert!(producer.last_flush().is_some());

    let loaded = producer.load_checkpoints(&task).await.unwrap();
    assert_eq!(loaded.get(&0).map(String::as_str), Some("4"));
    producer.shutdown().await;
}

#[tokio::test]
async fn test_failed_flush_does_not_advance_committed_cursor() {
    let (producer, transports, checkpoints) = producer(Duration::from_secs(3600)).await;
    let task = task();
    producer.send(&task, record(0, 1)).await.unwrap();

    transports.fail_next_flushes(1);
    assert!(producer.flush().await.is_err());
    assert!(checkpoints.committed().is_empty());
    assert_eq!(producer.pending_checkpoints().len(), 1);

    producer.flush().await.unwrap();
    assert_eq!(checkpoints.committed().len(), 1);
    producer.shutdown().await;
}

#[tokio::test]
async fn test_failed_commit_is_retried_on_next_tick() {
    let (producer, _, checkpoints) = producer(Duration::from_millis(20)).await;
    let task = task();
    checkpoints.fail_next_commits(2);
    producer.send(&task, record(0, 7)).await.unwrap();

    sleep(Duration::from_millis(200)).await;

    assert_eq!(checkpoints.committed()[&TaskPartition::new(&task.name, 0)], "7");
    assert!(producer.committed_checkpoints().contains_key(&TaskPartition::new(&task.name, 0)));
    producer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_and_retires() {
    let (producer, transports, checkpoints) = producer(Duration::from_secs(3600)).await;
    let task = task();
    producer.send(&task, record(1, 12)).await.unwrap();

    producer.shutdown().await;

    assert!(producer.is_retired());
    assert_eq!(transports.open_transports(), 0);
    assert_eq!(transports.delivered(DESTINATION).len(), 1);
    assert_eq!(checkpoints.committed()[&TaskPartition::new(&task.name, 1)], "12");

    let err = producer.send(&task, record(1, 13)).await.unwrap_err();
    assert!(matches!(err, Error::ProducerRetired(_)));

    let commits = checkpoints.commits();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(checkpoints.commits(), commits);

    // A second shutdown is a no-op.
    producer.shutdown().await;
    assert!(producer.is_retired());
}

#[tokio::test]
async fn test_clones_are_the_same_producer() {
    let (first, _, _) = producer(Duration::from_secs(3600)).await;
    let (second, _, _) = producer(Duration::from_secs(3600)).await;
    assert_eq!(first, first.clone());
    assert_ne!(first, second);
    first.shutdown().await;
    second.shutdown().await;
}
