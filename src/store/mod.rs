//! The durable block-storage collaborator.
//!
//! The partition never touches disks itself. Everything it persists (body
//! blocks, message-group state, the metadata key) goes through [`BlobStore`],
//! an opaque key → blob store that guarantees:
//!
//! - **Atomic batches**: every put and delete of a [`WriteBatch`] lands, or none does
//! - **Durability**: once `write` returns `Ok`, the batch survives restarts and is
//!   visible to subsequent `read` / `read_range` calls
//!
//! Errors are classified with [`crate::Error::is_permanent`]: transient errors
//! are retried by the partition with identical content, permanent ones move
//! it to the failed state.

pub mod log;
pub mod memory;

pub use log::LogStore;
pub use memory::MemoryStore;

use crate::error::Result;
use std::ops::Bound;

/// A key/blob pair as returned by reads.
pub type Entry = (Vec<u8>, Vec<u8>);

/// An atomic group of mutations. Deletes are applied before puts, so a key
/// both deleted and written ends up written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub puts: Vec<Entry>,
    pub deletes: Vec<Vec<u8>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.puts.push((key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.deletes.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    /// Total bytes of keys and values carried by the batch.
    pub fn size(&self) -> usize {
        self.puts.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
            + self.deletes.iter().map(Vec::len).sum::<usize>()
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Applies a batch atomically.
    async fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Reads the given keys. Missing keys are omitted from the result; found
    /// entries are returned in request order.
    async fn read(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Entry>>;

    /// Reads every entry whose key starts with `prefix`, in key order.
    async fn read_range(&self, prefix: Vec<u8>) -> Result<Vec<Entry>>;
}

/// Converts a key prefix into the equivalent key range.
pub fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(prefix.to_vec());
    let end = match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => Bound::Excluded(
            prefix[..i]
                .iter()
                .chain(std::iter::once(&(prefix[i] + 1)))
                .copied()
                .collect::<Vec<u8>>(),
        ),
        None => Bound::Unbounded,
    };
    (start, end)
}
