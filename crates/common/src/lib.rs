//! Common crate
//!
//! Shared types, provider interfaces, and error handling for Sluice.
//!
//! # Example
//! ```rust
//! use sluice_common::{Datastream, Task};
//! let mut stream = Datastream::new("orders", "kafka", "kafka://b1:9092/orders", "mem://orders");
//! stream.source.partitions = Some(4);
//! let task = Task::new(&stream);
//! assert_eq!(task.partitions.len(), 4);
//! ```

pub mod connection_string;
pub mod datastream;
pub mod diagnostics;
pub mod error;
pub mod provider;
pub mod record;

pub use connection_string::{BrokerAddress, SourceConnectionString};
pub use datastream::{Datastream, DatastreamDestination, DatastreamSource, SharingKey, Task};
pub use diagnostics::{StatusCode, TaskDiagnostics};
pub use error::{Error, Result};
pub use provider::{
    CheckpointCursor, CheckpointProvider, SourceConnection, SourceReader, SourceReaderFactory,
    TaskPartition, Transport, TransportProvider,
};
pub use record::{ProducerRecord, SourceRecord};
