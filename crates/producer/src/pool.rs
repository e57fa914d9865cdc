use crate::config::ProducerConfig;
use crate::producer::EventProducer;
use sluice_common::{CheckpointProvider, Error, Result, SharingKey, Task, TransportProvider};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hands out event producers keyed by (connector type, destination).
///
/// Every call is one reconciliation pass for a connector type: the task list
/// is the complete set that connector wants served. Tasks missing from it are
/// detached, and producers left without tasks are removed from the registry
/// and reported to the caller, who owns their teardown.
pub struct EventProducerPool {
    transport_provider: Arc<dyn TransportProvider>,
    checkpoint_provider: Arc<dyn CheckpointProvider>,
    config: ProducerConfig,
    registry: Mutex<HashMap<SharingKey, EventProducer>>,
}

impl EventProducerPool {
    pub fn new(
        transport_provider: Arc<dyn TransportProvider>,
        checkpoint_provider: Arc<dyn CheckpointProvider>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            transport_provider,
            checkpoint_provider,
            config,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_event_producers(
        &self,
        tasks: &[Task],
        connector_type: &str,
        reuse_existing_only: bool,
        unused_producers: &mut Vec<EventProducer>,
    ) -> Result<HashMap<Task, EventProducer>> {
        let mut registry = self.registry.lock().await;
        let wanted: HashMap<&Task, SharingKey> =
            tasks.iter().map(|t| (t, t.sharing_key(connector_type))).collect();

        if reuse_existing_only {
            if let Some((task, key)) = wanted.iter().find(|(_, key)| !registry.contains_key(*key)) {
                return Err(Error::ResourceExhaustion(format!(
                    "no event producer for {key} (task {task}) and creation is disabled"
                )));
            }
        }

        // Connect every missing transport before touching the registry so a
        // failure leaves all existing assignments as they were.
        let mut created: HashMap<SharingKey, EventProducer> = HashMap::new();
        for task in tasks {
            let key = &wanted[task];
            if registry.contains_key(key) || created.contains_key(key) {
                continue;
            }
            match self.transport_provider.connect(&key.destination).await {
                Ok(transport) => {
                    let producer = EventProducer::new(
                        key.clone(),
                        transport,
                        self.checkpoint_provider.clone(),
                        self.config.commit_interval(),
                    );
                    tracing::info!(producer = %producer.id(), key = %key, "created event producer");
                    created.insert(key.clone(), producer);
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "failed to connect transport");
                    for producer in created.into_values() {
                        producer.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        registry.extend(created);

        for (key, producer) in registry.iter().filter(|(k, _)| k.connector_type == connector_type) {
            producer.retain_tasks(|task| wanted.get(task) == Some(key));
        }

        let mut assignments = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let key = &wanted[task];
            let producer = registry.get(key).ok_or_else(|| {
                Error::Internal(format!("producer for {key} vanished during assignment"))
            })?;
            producer.attach(task.clone());
            assignments.insert(task.clone(), producer.clone());
        }

        let empty: Vec<SharingKey> = registry
            .iter()
            .filter(|(k, p)| k.connector_type == connector_type && p.task_count() == 0)
            .map(|(k, _)| k.clone())
            .collect();
        for key in empty {
            if let Some(producer) = registry.remove(&key) {
                tracing::info!(producer = %producer.id(), key = %key, "event producer is no longer used");
                unused_producers.push(producer);
            }
        }

        Ok(assignments)
    }

    pub async fn producer_for(&self, key: &SharingKey) -> Option<EventProducer> {
        self.registry.lock().await.get(key).cloned()
    }

    pub async fn producer_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Removes and retires every registered producer.
    pub async fn close(&self) {
        let producers: Vec<EventProducer> = self.registry.lock().await.drain().map(|(_, p)| p).collect();
        for producer in producers {
            producer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::Datastream;
    use sluice_connector_memory::{MemoryCheckpointProvider, MemoryTransportProvider};

    fn pool(transport: &MemoryTransportProvider) -> EventProducerPool {
        EventProducerPool::new(
            Arc::new(transport.clone()),
            Arc::new(MemoryCheckpointProvider::new()),
            ProducerConfig::default(),
        )
    }

    fn task(dest: &str) -> Task {
        let mut ds = Datastream::new("s", "kafka", "kafka://b1:9092/s", dest);
        ds.source.partitions = Some(1);
        Task::new(&ds)
    }

    #[tokio::test]
    async fn test_reuse_only_without_producer_leaves_registry_untouched() {
        let transport = MemoryTransportProvider::new();
        let pool = pool(&transport);
        let mut unused = Vec::new();
        let existing = task("mem://a");
        pool.get_event_producers(&[existing.clone()], "kafka", false, &mut unused)
            .await
            .unwrap();

        let err = pool
            .get_event_producers(&[existing.clone(), task("mem://b")], "kafka", true, &mut unused)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion(_)));
        assert_eq!(pool.producer_count().await, 1);
        assert_eq!(transport.connects(), 1);
        assert!(unused.is_empty());

        let producer = pool.producer_for(&existing.sharing_key("kafka")).await.unwrap();
        assert_eq!(producer.tasks(), vec![existing]);
    }

    #[tokio::test]
    async fn test_task_moving_destination_is_detached_from_old_producer() {
        let transport = MemoryTransportProvider::new();
        let pool = pool(&transport);
        let mut unused = Vec::new();
        let original = task("mem://a");
        let first = pool
            .get_event_producers(&[original.clone()], "kafka", false, &mut unused)
            .await
            .unwrap();

        let mut moved = original.clone();
        moved.destination.connection_string = "mem://b".to_string();
        let second = pool
            .get_event_producers(&[moved.clone()], "kafka", false, &mut unused)
            .await
            .unwrap();

        assert_ne!(first[&original], second[&moved]);
        assert_eq!(unused, vec![first[&original].clone()]);
        assert_eq!(pool.producer_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_retires_all_producers() {
        let transport = MemoryTransportProvider::new();
        let pool = pool(&transport);
        let mut unused = Vec::new();
        let assigned = pool
            .get_event_producers(&[task("mem://a"), task("mem://b")], "kafka", false, &mut unused)
            .await
            .unwrap();
        assert_eq!(transport.open_transports(), 2);

        pool.close().await;
        assert_eq!(pool.producer_count().await, 0);
        assert_eq!(transport.open_transports(), 0);
        assert!(assigned.values().all(EventProducer::is_retired));
    }
}
