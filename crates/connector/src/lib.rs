//! Connector crate
//!
//! Reconciles the tasks assigned to a node against running workers and
//! admits new datastreams. Workers share event producers through a
//! [`sluice_producer::EventProducerPool`].

pub mod config;
pub mod connector;
pub mod metrics;
pub mod worker;

pub use config::ConnectorConfig;
pub use connector::{Connector, KafkaConnector, CONNECTOR_TYPE};
pub use metrics::{MetricInfo, MetricKind};
pub use worker::{ConnectorTaskWorker, WorkerHandle};
