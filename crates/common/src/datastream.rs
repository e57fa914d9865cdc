use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use crate::error::{Error, Result};
use uuid::Uuid;

/// Metadata key holding the epoch-millis timestamp a stream should start reading from.
pub const START_POSITION: &str = "system.start.position";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastreamSource {
    pub connection_string: String,
    #[serde(default)]
    pub partitions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastreamDestination {
    pub connection_string: String,
    #[serde(default)]
    pub partitions: Option<u32>,
}

/// A logical stream from one source to one destination, as admitted by a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastream {
    pub name: String,
    pub connector_type: String,
    pub source: DatastreamSource,
    pub destination: DatastreamDestination,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Datastream {
    pub fn new(
        name: impl Into<String>,
        connector_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connector_type: connector_type.into(),
            source: DatastreamSource { connection_string: source.into(), partitions: None },
            destination: DatastreamDestination {
                connection_string: destination.into(),
                partitions: None,
            },
            metadata: BTreeMap::new(),
        }
    }

    pub fn start_position(&self) -> Result<Option<i64>> {
        start_position(&self.metadata)
    }
}

/// One partitioned unit of replication work.
///
/// Equality and hashing only look at the identity fields (connector type,
/// name and partitions), so two independently built values describing the
/// same assignment compare equal across reconciliation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub connector_type: String,
    pub datastreams: Vec<String>,
    pub partitions: Vec<u32>,
    pub source: DatastreamSource,
    pub destination: DatastreamDestination,
    /// Copied from the datastream; carries the start position, if any.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    /// Builds a task covering every known source partition of `stream`.
    pub fn new(stream: &Datastream) -> Self {
        let partitions = (0..stream.source.partitions.unwrap_or(0)).collect();
        Self::with_partitions(stream, partitions)
    }

    pub fn with_partitions(stream: &Datastream, mut partitions: Vec<u32>) -> Self {
        partitions.sort_unstable();
        partitions.dedup();
        Self {
            name: format!("{}_{}", stream.name, Uuid::new_v4().simple()),
            connector_type: stream.connector_type.clone(),
            datastreams: vec![stream.name.clone()],
            partitions,
            source: stream.source.clone(),
            destination: stream.destination.clone(),
            metadata: stream.metadata.clone(),
        }
    }

    /// Epoch-millis timestamp partitions without a checkpoint start reading from.
    pub fn start_position(&self) -> Result<Option<i64>> {
        start_position(&self.metadata)
    }

    pub fn sharing_key(&self, connector_type: &str) -> SharingKey {
        SharingKey::new(connector_type, &self.destination.connection_string)
    }

    fn identity(&self) -> (&str, &str, &[u32]) {
        (&self.connector_type, &self.name, &self.partitions)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.name, self.partitions)
    }
}

fn start_position(metadata: &BTreeMap<String, String>) -> Result<Option<i64>> {
    metadata
        .get(START_POSITION)
        .map(|ts| {
            ts.parse::<i64>()
                .map_err(|e| Error::validation(format!("invalid start position '{ts}': {e}")))
        })
        .transpose()
}

/// Decides which tasks may share an event producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharingKey {
    pub connector_type: String,
    pub destination: String,
}

impl SharingKey {
    pub fn new(connector_type: &str, destination: &str) -> Self {
        Self { connector_type: connector_type.to_string(), destination: destination.to_string() }
    }
}

impl fmt::Display for SharingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.connector_type, self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn stream(partitions: Option<u32>) -> Datastream {
        let mut ds = Datastream::new("orders", "kafka", "kafka://b1:9092/orders", "mem://orders-out");
        ds.source.partitions = partitions;
        ds
    }

    #[test]
    fn test_task_covers_all_source_partitions() {
        let task = Task::new(&stream(Some(3)));
        assert_eq!(task.partitions, vec![0, 1, 2]);
        assert_eq!(task.datastreams, vec!["orders".to_string()]);
        assert!(task.name.starts_with("orders_"));
    }

    #[test]
    fn test_task_equality_is_structural() {
        let task = Task::new(&stream(Some(2)));
        let mut copy = task.clone();
        copy.destination.connection_string = "mem://elsewhere".to_string();
        assert_eq!(task, copy);

        let mut set = HashSet::new();
        set.insert(task.clone());
        assert!(set.contains(&copy));

        let other = Task::new(&stream(Some(2)));
        assert_ne!(task, other);
    }

    #[test]
    fn test_partition_order_does_not_affect_identity() {
        let ds = stream(None);
        let a = Task::with_partitions(&ds, vec![2, 0, 1, 1]);
        let mut b = a.clone();
        b.partitions = vec![0, 1, 2];
        assert_eq!(a.partitions, vec![0, 1, 2]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sharing_key_separates_connector_types() {
        let task = Task::new(&stream(Some(1)));
        assert_eq!(task.sharing_key("kafka"), task.sharing_key("kafka"));
        assert_ne!(task.sharing_key("kafka"), task.sharing_key("file"));
    }

    #[test]
    fn test_task_inherits_start_position() {
        let mut ds = stream(Some(1));
        assert_eq!(Task::new(&ds).start_position().unwrap(), None);

        ds.metadata.insert(START_POSITION.to_string(), "1500".to_string());
        let task = Task::new(&ds);
        assert_eq!(task.start_position().unwrap(), Some(1500));
        assert_eq!(ds.start_position().unwrap(), Some(1500));

        ds.metadata.insert(START_POSITION.to_string(), "soon".to_string());
        assert!(matches!(ds.start_position(), Err(Error::Validation(_))));
    }
}
