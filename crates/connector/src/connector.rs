use crate::config::ConnectorConfig;
use crate::metrics::{worker_metric_infos, MetricInfo};
use crate::worker::{ConnectorTaskWorker, WorkerHandle, WorkerStatus};
use async_trait::async_trait;
use futures::FutureExt;
use sluice_common::{
    BrokerAddress, Datastream, DatastreamSource, Error, Result, SourceConnection,
    SourceConnectionString, SourceReaderFactory, StatusCode, Task, TaskDiagnostics,
};
use sluice_producer::{EventProducer, EventProducerPool};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Connector type of a [`KafkaConnector`] built from the default config.
pub const CONNECTOR_TYPE: &str = "kafka";

/// Control surface the coordination layer drives a connector through.
#[async_trait]
pub trait Connector: Send + Sync {
    fn connector_type(&self) -> &str;

    /// Prepares the worker execution context. Calling it again is a no-op.
    async fn start(&self) -> Result<()>;

    /// Stops every worker and waits a bounded grace period for them to exit.
    ///
    /// The connector is stopped when this returns either way;
    /// `Err(Error::ShutdownTimeout)` only reports that stragglers were aborted.
    async fn stop(&self) -> Result<()>;

    /// Reconciles running workers against `tasks`. Workers of removed tasks
    /// are signalled but not awaited.
    async fn on_assignment_change(&self, tasks: Vec<Task>) -> Result<()>;

    /// Validates and canonicalizes `stream` before it is admitted. On error
    /// `stream` is left untouched.
    async fn initialize_datastream(
        &self,
        stream: &mut Datastream,
        all_streams: &[Datastream],
    ) -> Result<()>;

    fn metric_infos(&self) -> Vec<MetricInfo>;

    async fn diagnostics(&self) -> Vec<TaskDiagnostics>;
}

/// Connector for partitioned-log sources.
///
/// The configured name is the connector type: it scopes the datastreams this
/// connector admits and the producers it owns in a shared pool.
pub struct KafkaConnector {
    config: ConnectorConfig,
    factory: Arc<dyn SourceReaderFactory>,
    pool: Arc<EventProducerPool>,
    whitelisted_brokers: HashSet<BrokerAddress>,
    running: Mutex<HashMap<Task, WorkerHandle>>,
    executor: Mutex<Option<JoinSet<()>>>,
}

impl KafkaConnector {
    pub fn new(
        config: ConnectorConfig,
        factory: Arc<dyn SourceReaderFactory>,
        pool: Arc<EventProducerPool>,
    ) -> Result<Self> {
        let whitelisted_brokers = config
            .whitelisted_clusters
            .iter()
            .map(|b| b.parse::<BrokerAddress>())
            .collect::<Result<HashSet<_>>>()?;
        Ok(Self {
            config,
            factory,
            pool,
            whitelisted_brokers,
            running: Mutex::new(HashMap::new()),
            executor: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Tasks that currently have a registered worker.
    pub async fn running_tasks(&self) -> Vec<Task> {
        self.running.lock().await.keys().cloned().collect()
    }

    /// The producer serving `task`'s worker, if it is running.
    pub async fn producer_for(&self, task: &Task) -> Option<EventProducer> {
        self.running.lock().await.get(task).map(|h| h.producer().clone())
    }

    fn is_whitelisted(&self, source: &SourceConnectionString) -> bool {
        self.whitelisted_brokers.is_empty()
            || source.brokers().any(|b| self.whitelisted_brokers.contains(b))
    }

    async fn validate(&self, stream: &Datastream) -> Result<DatastreamSource> {
        if stream.connector_type != self.config.name {
            return Err(Error::validation(format!(
                "datastream {} is for connector type {}, not {}",
                stream.name, stream.connector_type, self.config.name
            )));
        }
        let parsed: SourceConnectionString = stream.source.connection_string.parse()?;
        if !self.is_whitelisted(&parsed) {
            let mut allowed: Vec<String> =
                self.whitelisted_brokers.iter().map(ToString::to_string).collect();
            allowed.sort();
            return Err(Error::validation(format!(
                "connector {} is not white-listed for the cluster {}. Current white-listed clusters [{}]",
                self.config.name,
                stream.source.connection_string,
                allowed.join(", ")
            )));
        }
        let start_position = stream.start_position()?;

        let mut connection = self.factory.connect(&parsed).await?;
        let checked = check_source(
            connection.as_mut(),
            &parsed,
            stream.source.partitions,
            start_position,
        )
        .await;
        if let Err(e) = connection.close().await {
            tracing::warn!(source = %parsed, error = %e, "failed to close source connection");
        }
        let partitions = checked?;

        Ok(DatastreamSource { connection_string: parsed.to_string(), partitions: Some(partitions) })
    }
}

async fn check_source(
    connection: &mut dyn SourceConnection,
    source: &SourceConnectionString,
    configured_partitions: Option<u32>,
    start_position: Option<i64>,
) -> Result<u32> {
    let topic = source.topic();
    let actual = connection.partition_count(topic).await?;
    let partitions = match configured_partitions {
        None => {
            tracing::info!(source = %source, partitions = actual, "discovered source partitions");
            actual
        }
        Some(configured) if configured != actual => {
            return Err(Error::validation(format!(
                "source is configured with {configured} partitions, but the topic {topic} actually has {actual} partitions"
            )));
        }
        Some(configured) => configured,
    };

    if let Some(timestamp) = start_position {
        let all: Vec<u32> = (0..partitions).collect();
        let offsets = connection.offsets_for_timestamp(topic, &all, timestamp).await?;
        tracing::info!(source = %source, timestamp, ?offsets, "resolved start position");
        let unresolved: Vec<u32> = all
            .iter()
            .filter(|p| !matches!(offsets.get(*p), Some(Some(_))))
            .copied()
            .collect();
        if !unresolved.is_empty() {
            return Err(Error::validation(format!(
                "datastream is configured to start from timestamp {timestamp}, but partitions {unresolved:?} cannot map it to an offset"
            )));
        }
    }
    Ok(partitions)
}

/// Runs a worker inside its own fault boundary. Errors and panics end up in
/// the log and in the worker's status, never in the caller.
async fn supervise(worker: ConnectorTaskWorker, status: Arc<WorkerStatus>) {
    let task = worker.task().name.clone();
    match AssertUnwindSafe(worker.run()).catch_unwind().await {
        Ok(Ok(())) => status.set(StatusCode::Complete, "stopped"),
        Ok(Err(e)) => {
            let fault = Error::WorkerFault { task: task.clone(), message: e.to_string() };
            tracing::error!(task = %task, error = %fault, "worker terminated");
            status.set(StatusCode::Error, fault.to_string());
        }
        Err(panic) => {
            let fault = Error::WorkerFault { task: task.clone(), message: panic_message(panic.as_ref()) };
            tracing::error!(task = %task, error = %fault, "worker died due to a panic");
            status.set(StatusCode::Error, fault.to_string());
        }
    }
    status.mark_finished();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    fn connector_type(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> Result<()> {
        let mut executor = self.executor.lock().await;
        if executor.is_none() {
            *executor = Some(JoinSet::new());
            tracing::info!(connector = %self.config.name, "started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        for handle in running.values() {
            handle.stop();
        }
        running.clear();

        let Some(mut executor) = self.executor.lock().await.take() else {
            return Ok(());
        };
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while executor.join_next().await.is_some() {}
        })
        .await;

        let outcome = match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                let err = Error::ShutdownTimeout(grace);
                tracing::warn!(
                    connector = %self.config.name,
                    remaining = executor.len(),
                    error = %err,
                    "failed to shut down cleanly"
                );
                executor.abort_all();
                Err(err)
            }
        };

        // Every worker is gone, so this connector's producers can drain.
        let mut unused = Vec::new();
        if let Err(e) = self
            .pool
            .get_event_producers(&[], &self.config.name, false, &mut unused)
            .await
        {
            tracing::warn!(connector = %self.config.name, error = %e, "failed to release producers");
        }
        for producer in unused {
            producer.shutdown().await;
        }

        tracing::info!(connector = %self.config.name, "stopped");
        outcome
    }

    async fn on_assignment_change(&self, tasks: Vec<Task>) -> Result<()> {
        tracing::info!(connector = %self.config.name, tasks = tasks.len(), "assignment changed");
        let mut running = self.running.lock().await;
        let mut executor = self.executor.lock().await;
        let executor = executor
            .as_mut()
            .ok_or_else(|| Error::NotStarted(self.config.name.clone()))?;
        while executor.try_join_next().is_some() {}

        let desired: HashSet<&Task> = tasks.iter().collect();
        running.retain(|task, handle| {
            if !desired.contains(task) {
                tracing::info!(task = %task, "stopping worker");
                handle.stop();
                false
            } else if handle.is_finished() {
                tracing::info!(task = %task, "worker exited, scheduling a replacement");
                false
            } else {
                true
            }
        });

        let mut unused = Vec::new();
        let producers = self
            .pool
            .get_event_producers(&tasks, &self.config.name, false, &mut unused)
            .await?;

        // A kept task whose destination moved now maps to another producer.
        running.retain(|task, handle| match producers.get(task) {
            Some(producer) if producer != handle.producer() => {
                tracing::info!(task = %task, producer = %producer.id(), "destination changed, restarting worker");
                handle.stop();
                false
            }
            _ => true,
        });

        for task in &tasks {
            if running.contains_key(task) {
                continue;
            }
            let producer = producers.get(task).cloned().ok_or_else(|| {
                Error::Internal(format!("pool returned no producer for task {task}"))
            })?;
            tracing::info!(task = %task, producer = %producer.id(), "creating worker");
            let worker = ConnectorTaskWorker::new(task.clone(), producer, self.factory.clone(), &self.config);
            let handle = worker.handle();
            executor.spawn(supervise(worker, handle.status()));
            running.insert(task.clone(), handle);
        }

        for producer in unused {
            executor.spawn(async move { producer.shutdown().await });
        }
        Ok(())
    }

    async fn initialize_datastream(
        &self,
        stream: &mut Datastream,
        _all_streams: &[Datastream],
    ) -> Result<()> {
        tracing::info!(datastream = %stream.name, "initializing datastream");
        match self.validate(stream).await {
            Ok(source) => {
                stream.source = source;
                Ok(())
            }
            Err(e) => {
                tracing::error!(datastream = %stream.name, error = %e, "datastream initialization failed");
                Err(match e {
                    Error::Validation(_) => e,
                    other => Error::Validation(other.to_string()),
                })
            }
        }
    }

    fn metric_infos(&self) -> Vec<MetricInfo> {
        worker_metric_infos(&self.config.name)
    }

    async fn diagnostics(&self) -> Vec<TaskDiagnostics> {
        let running = self.running.lock().await;
        let mut diagnostics: Vec<TaskDiagnostics> = running.values().map(WorkerHandle::diagnostics).collect();
        diagnostics.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        diagnostics
    }
}
