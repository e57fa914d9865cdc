use async_trait::async_trait;
use sluice_common::{Error, ProducerRecord, Result, Transport, TransportProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Shared {
    delivered: Mutex<HashMap<String, Vec<ProducerRecord>>>,
    connects: AtomicUsize,
    open: AtomicUsize,
    flush_failures: AtomicUsize,
}

/// Destinations kept in memory. Records become visible in [`delivered`]
/// only once the owning transport flushes.
///
/// [`delivered`]: MemoryTransportProvider::delivered
#[derive(Clone, Default)]
pub struct MemoryTransportProvider {
    shared: Arc<Shared>,
}

impl MemoryTransportProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self, destination: &str) -> Vec<ProducerRecord> {
        let delivered = self.shared.delivered.lock().unwrap_or_else(|e| e.into_inner());
        delivered.get(destination).cloned().unwrap_or_default()
    }

    /// Number of transports ever opened.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn open_transports(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn fail_next_flushes(&self, n: usize) {
        self.shared.flush_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportProvider for MemoryTransportProvider {
    async fn connect(&self, destination: &str) -> Result<Box<dyn Transport>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(destination, "opened in-memory transport");
        Ok(Box::new(MemoryTransport {
            shared: self.shared.clone(),
            destination: destination.to_string(),
            buffer: Vec::new(),
            closed: false,
        }))
    }
}

struct MemoryTransport {
    shared: Arc<Shared>,
    destination: String,
    buffer: Vec<ProducerRecord>,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, record: &ProducerRecord) -> Result<()> {
        if self.closed {
            return Err(Error::transient(format!("transport to {} is closed", self.destination)));
        }
        self.buffer.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let failed = self
            .shared
            .flush_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::transient(format!("flush to {} failed", self.destination)));
        }
        let mut delivered = self.shared.delivered.lock().unwrap_or_else(|e| e.into_inner());
        delivered
            .entry(self.destination.clone())
            .or_default()
            .append(&mut self.buffer);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.shared.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
