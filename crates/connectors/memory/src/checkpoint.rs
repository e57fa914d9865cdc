use async_trait::async_trait;
use sluice_common::{CheckpointCursor, CheckpointProvider, Error, Result, Task};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Shared {
    committed: Mutex<CheckpointCursor>,
    commits: AtomicUsize,
    commit_failures: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryCheckpointProvider {
    shared: Arc<Shared>,
}

impl MemoryCheckpointProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> CheckpointCursor {
        self.shared.committed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn fail_next_commits(&self, n: usize) {
        self.shared.commit_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointProvider for MemoryCheckpointProvider {
    async fn commit(&self, checkpoints: &CheckpointCursor) -> Result<()> {
        let failed = self
            .shared
            .commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::transient("checkpoint store unavailable"));
        }
        let mut committed = self.shared.committed.lock().unwrap_or_else(|e| e.into_inner());
        committed.extend(checkpoints.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, task: &Task) -> Result<BTreeMap<u32, String>> {
        let committed = self.shared.committed.lock().unwrap_or_else(|e| e.into_inner());
        Ok(committed
            .iter()
            .filter(|(key, _)| key.task == task.name)
            .map(|(key, position)| (key.partition, position.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::{Datastream, TaskPartition};

    #[tokio::test]
    async fn test_load_returns_only_the_tasks_partitions() {
        let provider = MemoryCheckpointProvider::new();
        let mut ds = Datastream::new("orders", "kafka", "kafka://b1:9092/orders", "mem://out");
        ds.source.partitions = Some(2);
        let task = Task::new(&ds);

        let cursor = CheckpointCursor::from([
            (TaskPartition::new(&task.name, 0), "10".to_string()),
            (TaskPartition::new(&task.name, 1), "3".to_string()),
            (TaskPartition::new("someone-else", 0), "99".to_string()),
        ]);
        provider.commit(&cursor).await.unwrap();

        let loaded = provider.load(&task).await.unwrap();
        assert_eq!(loaded, BTreeMap::from([(0, "10".to_string()), (1, "3".to_string())]));
        assert_eq!(provider.commits(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_store_untouched() {
        let provider = MemoryCheckpointProvider::new();
        provider.fail_next_commits(1);
        let cursor = CheckpointCursor::from([(TaskPartition::new("t", 0), "1".to_string())]);
        assert!(provider.commit(&cursor).await.is_err());
        assert!(provider.committed().is_empty());
        provider.commit(&cursor).await.unwrap();
        assert_eq!(provider.committed().len(), 1);
    }
}
