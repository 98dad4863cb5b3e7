//! Quartz Persistence Layer
//!
//! Ordered key-value storage behind the `Store` trait, with a RocksDB
//! backend for production and an in-memory backend for tests. All state
//! mutations of a block are grouped into a `WriteBatch` and applied
//! atomically.

pub mod memory;
pub mod rocksdb_store;

pub use memory::MemoryStore;
pub use rocksdb_store::RocksDbStore;

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Storage-level error types
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Database(err.to_string())
    }
}

/// Iteration order over a key prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// A single mutation inside a batch.
#[derive(Clone, Debug)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered group of mutations applied atomically.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOperation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOperation::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOperation::Delete { key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<BatchOperation> {
        self.ops
    }
}

/// Ordered key-value store.
///
/// Keys are iterated in lexicographic byte order, which the ledger relies
/// on for its varint-encoded storage keys.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Applies all operations of the batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Visits every key starting with `prefix`, in the given direction.
    ///
    /// The visitor receives the key suffix after the prefix and the value;
    /// returning `false` stops the scan.
    fn for_each_prefix(
        &self,
        prefix: &[u8],
        direction: SeekDirection,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()>;
}

// Smallest key strictly greater than every key starting with `prefix`, or
// `None` when no such key exists.
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}
