//! A destination transport plus the checkpoint cursor of every task writing
//! through it.
//!
//! Sent positions sit in a pending cursor until the transport has flushed
//! them; only then are they committed to the checkpoint provider. A failed
//! commit leaves them pending for the next tick.

use chrono::{DateTime, Utc};
use sluice_common::{
    CheckpointCursor, CheckpointProvider, Error, ProducerRecord, Result, SharingKey, Task,
    TaskPartition, Transport,
};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

#[derive(Default)]
struct State {
    tasks: HashSet<Task>,
    pending: CheckpointCursor,
    committed: CheckpointCursor,
    last_flush: Option<DateTime<Utc>>,
    retired: bool,
}

struct FlushTimer {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    id: String,
    key: SharingKey,
    commit_interval: Duration,
    checkpoint_provider: Arc<dyn CheckpointProvider>,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    // Serializes flushes so commits never go backwards.
    flush_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    timer: Mutex<Option<FlushTimer>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to one producer. Clones refer to the same instance and
/// compare equal; distinct instances never do.
#[derive(Clone)]
pub struct EventProducer {
    inner: Arc<Inner>,
}

impl EventProducer {
    /// Wraps `transport` and starts the periodic flush timer. Must be called
    /// from within a tokio runtime.
    pub fn new(
        key: SharingKey,
        transport: Box<dyn Transport>,
        checkpoint_provider: Arc<dyn CheckpointProvider>,
        commit_interval: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            id: Uuid::new_v4().to_string(),
            key,
            commit_interval,
            checkpoint_provider,
            transport: tokio::sync::Mutex::new(Some(transport)),
            flush_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(State::default()),
            timer: Mutex::new(None),
        });
        let timer = spawn_flush_timer(Arc::downgrade(&inner), commit_interval);
        *inner.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(timer);
        tracing::debug!(producer = %inner.id, key = %inner.key, "started checkpoint flush timer");
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn sharing_key(&self) -> &SharingKey {
        &self.inner.key
    }

    pub fn commit_interval(&self) -> Duration {
        self.inner.commit_interval
    }

    /// Writes `record` for `task`. Its source checkpoint becomes committable
    /// after the next successful flush.
    pub async fn send(&self, task: &Task, record: ProducerRecord) -> Result<()> {
        let mut guard = self.inner.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| Error::ProducerRetired(self.inner.id.clone()))?;
        transport.send(&record).await?;
        self.inner
            .state()
            .pending
            .insert(TaskPartition::new(&task.name, record.partition), record.source_checkpoint);
        Ok(())
    }

    /// Flushes the transport and commits everything it made durable.
    pub async fn flush(&self) -> Result<()> {
        let _flushing = self.inner.flush_lock.lock().await;
        let snapshot = {
            let mut guard = self.inner.transport.lock().await;
            let transport = guard
                .as_mut()
                .ok_or_else(|| Error::ProducerRetired(self.inner.id.clone()))?;
            transport.flush().await?;
            self.inner.state().pending.clone()
        };
        if snapshot.is_empty() {
            self.inner.state().last_flush = Some(Utc::now());
            return Ok(());
        }

        self.inner.checkpoint_provider.commit(&snapshot).await?;

        let mut state = self.inner.state();
        for (key, position) in snapshot {
            if state.pending.get(&key) == Some(&position) {
                state.pending.remove(&key);
            }
            state.committed.insert(key, position);
        }
        state.last_flush = Some(Utc::now());
        Ok(())
    }

    /// Last committed positions of `task`, as known to the checkpoint provider.
    pub async fn load_checkpoints(&self, task: &Task) -> Result<BTreeMap<u32, String>> {
        self.inner.checkpoint_provider.load(task).await
    }

    pub fn committed_checkpoints(&self) -> CheckpointCursor {
        self.inner.state().committed.clone()
    }

    pub fn pending_checkpoints(&self) -> CheckpointCursor {
        self.inner.state().pending.clone()
    }

    pub fn last_flush(&self) -> Option<DateTime<Utc>> {
        self.inner.state().last_flush
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.state().tasks.iter().cloned().collect()
    }

    pub fn task_count(&self) -> usize {
        self.inner.state().tasks.len()
    }

    pub fn is_retired(&self) -> bool {
        self.inner.state().retired
    }

    pub(crate) fn attach(&self, task: Task) {
        self.inner.state().tasks.insert(task);
    }

    /// Drops every assigned task for which `keep` returns false.
    pub(crate) fn retain_tasks(&self, mut keep: impl FnMut(&Task) -> bool) {
        self.inner.state().tasks.retain(|t| keep(t));
    }

    /// Cancels the flush timer, attempts a final flush and releases the
    /// transport. Safe to call more than once.
    pub async fn shutdown(&self) {
        let timer = self.inner.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(timer) = timer {
            let _ = timer.shutdown.send(());
            if let Err(e) = timer.handle.await {
                tracing::error!(producer = %self.inner.id, error = %e, "flush timer panicked");
            }
        }

        match self.flush().await {
            Ok(()) | Err(Error::ProducerRetired(_)) => {}
            Err(e) => {
                tracing::warn!(producer = %self.inner.id, error = %e, "final checkpoint flush failed")
            }
        }

        if let Some(mut transport) = self.inner.transport.lock().await.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(producer = %self.inner.id, error = %e, "failed to close transport");
            }
            tracing::info!(producer = %self.inner.id, key = %self.inner.key, "event producer retired");
        }
        self.inner.state().retired = true;
    }
}

fn spawn_flush_timer(inner: Weak<Inner>, period: Duration) -> FlushTimer {
    let (shutdown, mut cancelled) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let producer = EventProducer { inner };
                    if let Err(e) = producer.flush().await {
                        tracing::warn!(
                            producer = %producer.id(),
                            error = %e,
                            "checkpoint flush failed, retrying next tick"
                        );
                    }
                }
            }
        }
    });
    FlushTimer { shutdown, handle }
}

impl PartialEq for EventProducer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventProducer {}

impl Hash for EventProducer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for EventProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProducer")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("tasks", &self.task_count())
            .finish()
    }
}
