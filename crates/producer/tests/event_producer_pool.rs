use sluice_common::{Datastream, Task};
use sluice_connector_memory::{MemoryCheckpointProvider, MemoryTransportProvider};
use sluice_producer::{EventProducer, EventProducerPool, ProducerConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn new_pool() -> (EventProducerPool, MemoryTransportProvider) {
    let transport = MemoryTransportProvider::new();
    let pool = EventProducerPool::new(
        Arc::new(transport.clone()),
        Arc::new(MemoryCheckpointProvider::new()),
        ProducerConfig::with_commit_interval(Duration::from_millis(50)),
    );
    (pool, transport)
}

/// A task of datastream `n`, whose destination is `mem://destination-n`.
fn task(n: u32) -> Task {
    let mut ds = Datastream::new(
        format!("stream-{n}"),
        "kafka",
        format!("kafka://broker:9092/topic-{n}"),
        format!("mem://destination-{n}"),
    );
    ds.source.partitions = Some(1);
    Task::new(&ds)
}

#[tokio::test]
async fn test_empty_pool_creates_one_producer_per_destination() {
    let (pool, _) = new_pool();
    let tasks = vec![task(1), task(2)];

    let producers = pool
        .get_event_producers(&tasks, "connectortype", false, &mut Vec::new())
        .await
        .unwrap();

    assert_eq!(producers.len(), 2);
    for t in &tasks {
        assert!(producers.contains_key(t));
    }
    assert_ne!(producers[&tasks[0]], producers[&tasks[1]]);
}

#[tokio::test]
async fn test_producers_not_shared_for_different_connector_types() {
    let (pool, transport) = new_pool();
    let connector1_tasks = vec![task(1), task(2)];
    let connector2_tasks = vec![task(1), task(2)];

    let producers1 = pool
        .get_event_producers(&connector1_tasks, "connectortype1", false, &mut Vec::new())
        .await
        .unwrap();
    let producers2 = pool
        .get_event_producers(&connector2_tasks, "connectortype2", false, &mut Vec::new())
        .await
        .unwrap();

    for producer1 in producers1.values() {
        for producer2 in producers2.values() {
            assert_ne!(producer1, producer2);
        }
    }
    assert_eq!(transport.connects(), 4);
    assert_eq!(pool.producer_count().await, 4);
}

#[tokio::test]
async fn test_connector_types_do_not_detach_each_others_tasks() {
    let (pool, _) = new_pool();
    let shared_destination = task(1);

    let first = pool
        .get_event_producers(&[shared_destination.clone()], "type-a", false, &mut Vec::new())
        .await
        .unwrap();
    let mut unused = Vec::new();
    pool.get_event_producers(&[], "type-b", false, &mut unused).await.unwrap();

    assert!(unused.is_empty());
    assert_eq!(first[&shared_destination].task_count(), 1);
}

#[tokio::test]
async fn test_producer_creation_multiple_times() {
    let (pool, transport) = new_pool();
    let mut tasks = vec![task(1), task(2)];

    let first = pool
        .get_event_producers(&tasks, "connectorType", false, &mut Vec::new())
        .await
        .unwrap();

    tasks.push(task(3));
    tasks.push(task(4));
    let second = pool
        .get_event_producers(&tasks, "connectorType", false, &mut Vec::new())
        .await
        .unwrap();

    assert_eq!(first[&tasks[0]], second[&tasks[0]]);
    assert_eq!(first[&tasks[1]], second[&tasks[1]]);

    let unique: HashSet<&EventProducer> = second.values().collect();
    assert_eq!(unique.len(), 4);
    assert_eq!(transport.connects(), 4);
}

#[tokio::test]
async fn test_producer_shared_for_tasks_with_same_destination() {
    let (pool, _) = new_pool();
    let tasks = vec![task(1), task(2), task(1)];
    assert_ne!(tasks[0], tasks[2]);

    let producers = pool
        .get_event_producers(&tasks, "connectorType", false, &mut Vec::new())
        .await
        .unwrap();

    assert_eq!(producers[&tasks[0]], producers[&tasks[2]]);
    assert_eq!(producers[&tasks[0]].task_count(), 2);
}

#[tokio::test]
async fn test_unused_producers() {
    let (pool, _) = new_pool();
    let mut tasks = vec![task(1), task(2)];
    let mut unused = Vec::new();

    let first = pool
        .get_event_producers(&tasks, "connectorType", false, &mut unused)
        .await
        .unwrap();
    assert!(unused.is_empty());

    let removed = tasks.remove(1);
    let second = pool
        .get_event_producers(&tasks, "connectorType", false, &mut unused)
        .await
        .unwrap();

    assert_eq!(first[&tasks[0]], second[&tasks[0]]);
    assert_eq!(unused, vec![first[&removed].clone()]);

    // Reported once; later passes do not report it again.
    pool.get_event_producers(&tasks, "connectorType", false, &mut unused)
        .await
        .unwrap();
    assert_eq!(unused.len(), 1);
}

#[tokio::test]
async fn test_shared_producer_lifecycle_scenario() {
    let (pool, _) = new_pool();
    let t1 = task(1);
    let t2 = task(2);
    let t3 = {
        let mut t = task(3);
        t.destination = t1.destination.clone();
        t
    };

    let mut unused = Vec::new();
    let round1 = pool
        .get_event_producers(&[t1.clone(), t2.clone()], "X", false, &mut unused)
        .await
        .unwrap();
    assert_eq!(round1.len(), 2);
    assert_ne!(round1[&t1], round1[&t2]);

    let round2 = pool
        .get_event_producers(&[t1.clone(), t2.clone(), t3.clone()], "X", false, &mut unused)
        .await
        .unwrap();
    assert_eq!(round2[&t1], round2[&t3]);
    assert_eq!(round2.values().collect::<HashSet<_>>().len(), 2);
    assert!(unused.is_empty());

    let round3 = pool
        .get_event_producers(&[t1.clone(), t3.clone()], "X", false, &mut unused)
        .await
        .unwrap();
    assert_eq!(unused, vec![round1[&t2].clone()]);
    assert_eq!(round3[&t1], round1[&t1]);
    assert_eq!(round3[&t3], round1[&t1]);
    assert!(!unused.contains(&round3[&t1]));
}

#[tokio::test]
async fn test_reuse_existing_only_returns_registered_producers() {
    let (pool, transport) = new_pool();
    let t1 = task(1);
    let created = pool
        .get_event_producers(&[t1.clone()], "X", false, &mut Vec::new())
        .await
        .unwrap();

    let mut sibling = task(5);
    sibling.destination = t1.destination.clone();
    let reused = pool
        .get_event_producers(&[t1.clone(), sibling.clone()], "X", true, &mut Vec::new())
        .await
        .unwrap();

    assert_eq!(reused[&sibling], created[&t1]);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_for_one_key_create_one_producer() {
    let (pool, transport) = new_pool();
    let pool = Arc::new(pool);
    let destination = task(1).destination;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let mut t = task(9);
        t.destination = destination.clone();
        handles.push(tokio::spawn(async move {
            pool.get_event_producers(&[t], "X", false, &mut Vec::new()).await
        }));
    }

    let mut producers = HashSet::new();
    for handle in handles {
        let assigned = handle.await.unwrap().unwrap();
        producers.extend(assigned.into_values());
    }
    assert_eq!(producers.len(), 1);
    assert_eq!(transport.connects(), 1);
}
