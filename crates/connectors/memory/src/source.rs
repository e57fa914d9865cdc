use async_trait::async_trait;
use sluice_common::{
    Error, Result, SourceConnection, SourceConnectionString, SourceReader, SourceReaderFactory,
    SourceRecord, Task,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const MAX_POLL_RECORDS: usize = 500;

type Partitions = Vec<Vec<SourceRecord>>;

#[derive(Default)]
struct Shared {
    topics: RwLock<HashMap<String, Partitions>>,
    poisoned: RwLock<HashSet<String>>,
    open_connections: AtomicUsize,
    open_readers: AtomicUsize,
    readers_created: AtomicUsize,
    poll_failures: AtomicUsize,
    connect_failures: AtomicUsize,
}

/// A partitioned log held in memory. Cloning shares the same topics.
#[derive(Clone, Default)]
pub struct MemorySource {
    shared: Arc<Shared>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_topic(&self, topic: &str, partitions: u32) {
        let mut topics = self.shared.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
    }

    /// Appends a record and returns its offset.
    pub async fn append(
        &self,
        topic: &str,
        partition: u32,
        value: impl Into<Vec<u8>>,
        timestamp: i64,
    ) -> Result<i64> {
        let mut topics = self.shared.topics.write().await;
        let log = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .ok_or_else(|| Error::Internal(format!("unknown partition {topic}-{partition}")))?;
        let offset = log.len() as i64;
        log.push(SourceRecord { partition, offset, key: None, value: value.into(), timestamp });
        Ok(offset)
    }

    /// Readers of `topic` panic on their next poll.
    pub async fn poison_topic(&self, topic: &str) {
        self.shared.poisoned.write().await.insert(topic.to_string());
    }

    /// The next `n` polls across all readers fail with a transient error.
    pub fn fail_next_polls(&self, n: usize) {
        self.shared.poll_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    pub fn open_readers(&self) -> usize {
        self.shared.open_readers.load(Ordering::SeqCst)
    }

    /// Number of readers ever created.
    pub fn readers_created(&self) -> usize {
        self.shared.readers_created.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SourceReaderFactory for MemorySource {
    async fn create_reader(&self, task: &Task) -> Result<Box<dyn SourceReader>> {
        let parsed: SourceConnectionString = task.source.connection_string.parse()?;
        let topic = parsed.topic().to_string();
        if !self.shared.topics.read().await.contains_key(&topic) {
            return Err(Error::transient(format!("topic {topic} is not available")));
        }
        self.shared.open_readers.fetch_add(1, Ordering::SeqCst);
        self.shared.readers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReader {
            source: self.clone(),
            topic,
            positions: task.partitions.iter().map(|p| (*p, 0)).collect(),
            closed: false,
        }))
    }

    async fn connect(&self, source: &SourceConnectionString) -> Result<Box<dyn SourceConnection>> {
        if Self::take_failure(&self.shared.connect_failures) {
            return Err(Error::transient(format!("cannot reach {source}")));
        }
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection { source: self.clone(), closed: false }))
    }
}

struct MemoryReader {
    source: MemorySource,
    topic: String,
    positions: BTreeMap<u32, i64>,
    closed: bool,
}

#[async_trait]
impl SourceReader for MemoryReader {
    async fn seek(&mut self, partition: u32, offset: i64) -> Result<()> {
        match self.positions.get_mut(&partition) {
            Some(position) => {
                *position = offset.max(0);
                Ok(())
            }
            None => Err(Error::Internal(format!("partition {partition} is not assigned"))),
        }
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<SourceRecord>> {
        if self.source.shared.poisoned.read().await.contains(&self.topic) {
            panic!("topic {} is poisoned", self.topic);
        }
        if MemorySource::take_failure(&self.source.shared.poll_failures) {
            return Err(Error::transient(format!("poll of {} failed", self.topic)));
        }

        let mut batch = Vec::new();
        {
            let topics = self.source.shared.topics.read().await;
            let partitions = topics
                .get(&self.topic)
                .ok_or_else(|| Error::transient(format!("topic {} disappeared", self.topic)))?;
            for (partition, position) in self.positions.iter_mut() {
                let Some(log) = partitions.get(*partition as usize) else {
                    continue;
                };
                let room = MAX_POLL_RECORDS - batch.len();
                if room == 0 {
                    break;
                }
                let start = *position as usize;
                let end = log.len().min(start + room);
                if start < end {
                    batch.extend_from_slice(&log[start..end]);
                    *position = end as i64;
                }
            }
        }

        if batch.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(batch)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.source.shared.open_readers.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryConnection {
    source: MemorySource,
    closed: bool,
}

#[async_trait]
impl SourceConnection for MemoryConnection {
    async fn partition_count(&mut self, topic: &str) -> Result<u32> {
        let topics = self.source.shared.topics.read().await;
        topics
            .get(topic)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| Error::validation(format!("topic {topic} does not exist")))
    }

    async fn offsets_for_timestamp(
        &mut self,
        topic: &str,
        partitions: &[u32],
        timestamp: i64,
    ) -> Result<BTreeMap<u32, Option<i64>>> {
        let topics = self.source.shared.topics.read().await;
        let logs = topics
            .get(topic)
            .ok_or_else(|| Error::validation(format!("topic {topic} does not exist")))?;
        Ok(partitions
            .iter()
            .map(|p| {
                let offset = logs
                    .get(*p as usize)
                    .and_then(|log| log.iter().find(|r| r.timestamp >= timestamp))
                    .map(|r| r.offset);
                (*p, offset)
            })
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.source.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
