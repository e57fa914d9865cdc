//! Capability interfaces the engine consumes but does not implement.
//!
//! Source clients, the destination write path and checkpoint persistence
//! all live behind these traits.

use crate::connection_string::SourceConnectionString;
use crate::datastream::Task;
use crate::error::Result;
use crate::record::{ProducerRecord, SourceRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Reads records for the partitions of a single task.
#[async_trait]
pub trait SourceReader: Send {
    /// Positions `partition` so the next poll returns records from `offset` on.
    async fn seek(&mut self, partition: u32, offset: i64) -> Result<()>;

    /// Waits up to `timeout` for records. An empty batch is not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<SourceRecord>>;

    async fn close(&mut self) -> Result<()>;
}

/// A short-lived metadata connection used while admitting a datastream.
#[async_trait]
pub trait SourceConnection: Send {
    async fn partition_count(&mut self, topic: &str) -> Result<u32>;

    /// Maps `timestamp` to the first offset at or after it for each partition.
    /// `None` means the partition cannot resolve the timestamp.
    async fn offsets_for_timestamp(
        &mut self,
        topic: &str,
        partitions: &[u32],
        timestamp: i64,
    ) -> Result<BTreeMap<u32, Option<i64>>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait SourceReaderFactory: Send + Sync {
    async fn create_reader(&self, task: &Task) -> Result<Box<dyn SourceReader>>;

    async fn connect(&self, source: &SourceConnectionString) -> Result<Box<dyn SourceConnection>>;
}

/// Exclusive write handle to one destination.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, record: &ProducerRecord) -> Result<()>;

    /// Blocks until every record sent so far is durable at the destination.
    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(&self, destination: &str) -> Result<Box<dyn Transport>>;
}

/// Key of one entry in a checkpoint cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskPartition {
    pub task: String,
    pub partition: u32,
}

impl TaskPartition {
    pub fn new(task: &str, partition: u32) -> Self {
        Self { task: task.to_string(), partition }
    }
}

impl fmt::Display for TaskPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.task, self.partition)
    }
}

/// Last durably delivered source position per task partition.
pub type CheckpointCursor = BTreeMap<TaskPartition, String>;

#[async_trait]
pub trait CheckpointProvider: Send + Sync {
    async fn commit(&self, checkpoints: &CheckpointCursor) -> Result<()>;

    /// Returns the committed position of each partition of `task`.
    async fn load(&self, task: &Task) -> Result<BTreeMap<u32, String>>;
}
