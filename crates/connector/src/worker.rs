//! One worker per task: pull from the task's source reader, push through the
//! shared event producer, stop when asked.

use crate::config::ConnectorConfig;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use sluice_common::{
    Error, Result, SourceConnectionString, SourceReader, SourceReaderFactory, StatusCode, Task,
    TaskDiagnostics,
};
use sluice_producer::EventProducer;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Cooperative stop flag. Checked between poll/send cycles; also wakes a
/// worker that is sleeping in backoff.
#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct Status {
    code: StatusCode,
    message: String,
    checkpoint: BTreeMap<u32, i64>,
}

/// Progress and health of a worker, shared with the connector.
pub(crate) struct WorkerStatus {
    status: Mutex<Status>,
    events_processed: AtomicU64,
    finished: AtomicBool,
}

impl WorkerStatus {
    fn new() -> Self {
        Self {
            status: Mutex::new(Status {
                code: StatusCode::Ok,
                message: "scheduled".to_string(),
                checkpoint: BTreeMap::new(),
            }),
            events_processed: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Status) -> R) -> R {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status)
    }

    pub(crate) fn set(&self, code: StatusCode, message: impl Into<String>) {
        let message = message.into();
        self.with(|s| {
            s.code = code;
            s.message = message;
        });
    }

    fn record_position(&self, partition: u32, offset: i64) {
        self.with(|s| s.checkpoint.insert(partition, offset));
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// The connector's view of a scheduled worker.
pub struct WorkerHandle {
    task: Task,
    producer: EventProducer,
    stop: Arc<StopSignal>,
    status: Arc<WorkerStatus>,
}

impl WorkerHandle {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn producer(&self) -> &EventProducer {
        &self.producer
    }

    /// Asks the worker to exit after its current cycle. Does not wait.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// True once the worker's run loop has returned, for whatever reason.
    pub fn is_finished(&self) -> bool {
        self.status.finished.load(Ordering::SeqCst)
    }

    pub fn events_processed(&self) -> u64 {
        self.status.events_processed.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> TaskDiagnostics {
        self.status
            .with(|s| TaskDiagnostics::new(&self.task, s.code, &s.message, &s.checkpoint))
    }

    pub(crate) fn status(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }
}

pub struct ConnectorTaskWorker {
    task: Task,
    producer: EventProducer,
    factory: Arc<dyn SourceReaderFactory>,
    stop: Arc<StopSignal>,
    status: Arc<WorkerStatus>,
    poll_timeout: Duration,
    retry_initial: Duration,
    retry_max: Duration,
}

impl ConnectorTaskWorker {
    pub fn new(
        task: Task,
        producer: EventProducer,
        factory: Arc<dyn SourceReaderFactory>,
        config: &ConnectorConfig,
    ) -> Self {
        Self {
            task,
            producer,
            factory,
            stop: Arc::new(StopSignal::default()),
            status: Arc::new(WorkerStatus::new()),
            poll_timeout: config.poll_timeout(),
            retry_initial: config.retry_initial(),
            retry_max: config.retry_max(),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            task: self.task.clone(),
            producer: self.producer.clone(),
            stop: self.stop.clone(),
            status: self.status.clone(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Runs until stopped or until a non-transient error occurs. The source
    /// reader is closed on every exit path.
    pub async fn run(self) -> Result<()> {
        tracing::info!(task = %self.task, producer = %self.producer.id(), "worker starting");
        let Some(mut reader) = self.open_reader().await? else {
            return Ok(());
        };
        self.status.set(StatusCode::Ok, "running");
        let result = self.consume(reader.as_mut()).await;
        if let Err(e) = reader.close().await {
            tracing::warn!(task = %self.task, error = %e, "failed to close source reader");
        }
        result
    }

    async fn open_reader(&self) -> Result<Option<Box<dyn SourceReader>>> {
        let mut backoff = self.backoff();
        loop {
            if self.stop.is_stopped() {
                return Ok(None);
            }
            match self.factory.create_reader(&self.task).await {
                Ok(reader) => return Ok(Some(reader)),
                Err(e) if e.is_transient() => self.pause(&mut backoff, &e).await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn consume(&self, reader: &mut dyn SourceReader) -> Result<()> {
        let checkpoints = self.producer.load_checkpoints(&self.task).await?;
        for (partition, position) in &checkpoints {
            let offset: i64 = position.parse().map_err(|e| {
                Error::Internal(format!("bad checkpoint '{position}' for partition {partition}: {e}"))
            })?;
            reader.seek(*partition, offset + 1).await?;
            self.status.record_position(*partition, offset);
            tracing::debug!(task = %self.task, partition, offset, "resuming from checkpoint");
        }
        if let Some(timestamp) = self.task.start_position()? {
            let fresh: Vec<u32> = self
                .task
                .partitions
                .iter()
                .filter(|p| !checkpoints.contains_key(*p))
                .copied()
                .collect();
            if !fresh.is_empty() {
                self.seek_to_timestamp(reader, &fresh, timestamp).await?;
            }
        }

        let mut backoff = self.backoff();
        while !self.stop.is_stopped() {
            let records = match reader.poll(self.poll_timeout).await {
                Ok(records) => {
                    backoff.reset();
                    records
                }
                Err(e) if e.is_transient() => {
                    self.pause(&mut backoff, &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for record in records {
                let (partition, offset) = (record.partition, record.offset);
                if !self.deliver(record.into()).await? {
                    return Ok(());
                }
                self.status.record_position(partition, offset);
                self.status.events_processed.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::info!(task = %self.task, "worker stopped");
        Ok(())
    }

    /// Positions `partitions` at the first record at or after `timestamp`.
    /// A partition with no such record keeps the reader's default position.
    async fn seek_to_timestamp(
        &self,
        reader: &mut dyn SourceReader,
        partitions: &[u32],
        timestamp: i64,
    ) -> Result<()> {
        let source: SourceConnectionString = self.task.source.connection_string.parse()?;
        let mut connection = self.factory.connect(&source).await?;
        let resolved = connection.offsets_for_timestamp(source.topic(), partitions, timestamp).await;
        if let Err(e) = connection.close().await {
            tracing::warn!(task = %self.task, error = %e, "failed to close source connection");
        }
        for (partition, offset) in resolved? {
            match offset {
                Some(offset) => {
                    reader.seek(partition, offset).await?;
                    tracing::debug!(task = %self.task, partition, offset, timestamp, "starting from timestamp");
                }
                None => {
                    tracing::warn!(task = %self.task, partition, timestamp, "no offset for start position");
                }
            }
        }
        Ok(())
    }

    /// Sends one record, retrying transient failures. Returns false if the
    /// worker was stopped before the record went out.
    async fn deliver(&self, record: sluice_common::ProducerRecord) -> Result<bool> {
        let mut backoff = self.backoff();
        loop {
            match self.producer.send(&self.task, record.clone()).await {
                Ok(()) => return Ok(true),
                Err(_) if self.stop.is_stopped() => return Ok(false),
                Err(e) if e.is_transient() => self.pause(&mut backoff, &e).await,
                Err(e) => return Err(e),
            }
            if self.stop.is_stopped() {
                return Ok(false);
            }
        }
    }

    async fn pause(&self, backoff: &mut ExponentialBackoff, error: &Error) {
        let delay = backoff.next_backoff().unwrap_or(self.retry_max);
        tracing::warn!(task = %self.task, error = %error, ?delay, "transient failure, backing off");
        self.status.set(StatusCode::Ok, format!("retrying: {error}"));
        // Enabled before the flag check so a concurrent stop always wakes us.
        let notified = self.stop.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.stop.is_stopped() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = notified => {}
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial)
            .with_max_interval(self.retry_max)
            .with_max_elapsed_time(None)
            .build()
    }
}
