use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{prefix_range, BlobStore, Entry, WriteBatch};
use crate::error::{Error, Result};

/// Failure injected into the next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
}

/// In-memory [`BlobStore`] used by tests and single-process deployments.
///
/// Supports fault injection so flush retry and the failed state can be
/// exercised deterministically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    faults: Mutex<VecDeque<Fault>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with the given fault.
    pub fn inject_faults(&self, fault: Fault, count: usize) -> Result<()> {
        let mut faults = self.faults.lock()?;
        faults.extend(std::iter::repeat(fault).take(count));
        Ok(())
    }

    /// Number of batches successfully applied.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Keys currently stored under `prefix`.
    pub fn keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let data = self.data.lock()?;
        Ok(data
            .range(prefix_range(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn apply(&self, batch: WriteBatch) -> Result<()> {
        if let Some(fault) = self.faults.lock()?.pop_front() {
            return Err(match fault {
                Fault::Transient => Error::StorageUnavailable("injected transient fault".into()),
                Fault::Permanent => Error::StorageFull("injected permanent fault".into()),
            });
        }

        let mut data = self.data.lock()?;
        for key in batch.deletes {
            data.remove(&key);
        }
        for (key, value) in batch.puts {
            data.insert(key, value);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.apply(batch)
    }

    async fn read(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Entry>> {
        let data = self.data.lock()?;
        Ok(keys
            .into_iter()
            .filter_map(|key| data.get(&key).cloned().map(|value| (key, value)))
            .collect())
    }

    async fn read_range(&self, prefix: Vec<u8>) -> Result<Vec<Entry>> {
        let data = self.data.lock()?;
        Ok(data
            .range(prefix_range(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
