//! RocksDB storage backend.

use crate::{prefix_upper_bound, BatchOperation, Error, Result, SeekDirection, Store, WriteBatch};
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::Path;
use tracing::info;

/// RocksDB-backed store tuned for the ledger's write pattern: one atomic
/// batch per block plus point lookups during validation.
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_compression_type(rocksdb::DBCompressionType::Lz4);
        options.set_level_compaction_dynamic_level_bytes(true);
        options.increase_parallelism(2);
        let db = DB::open(&options, path.as_ref())
            .map_err(|e| Error::Database(format!("failed to open RocksDB: {}", e)))?;
        info!(path = %path.as_ref().display(), "opened RocksDB store");
        Ok(Self { db })
    }
}

impl Store for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(key, value)?)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.delete(key)?)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut db_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOperation::Put { key, value } => db_batch.put(key, value),
                BatchOperation::Delete { key } => db_batch.delete(key),
            }
        }
        Ok(self.db.write(db_batch)?)
    }

    fn for_each_prefix(
        &self,
        prefix: &[u8],
        direction: SeekDirection,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let upper = prefix_upper_bound(prefix);
        let mode = match direction {
            SeekDirection::Forward => IteratorMode::From(prefix, Direction::Forward),
            SeekDirection::Backward => match upper.as_deref() {
                Some(bound) => IteratorMode::From(bound, Direction::Reverse),
                None => IteratorMode::End,
            },
        };
        for item in self.db.iterator(mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                match direction {
                    // Forward scans leave the prefix range for good.
                    SeekDirection::Forward => break,
                    // A reverse scan may start on the upper bound key
                    // itself before descending into the range.
                    SeekDirection::Backward => {
                        if key.as_ref() < prefix {
                            break;
                        }
                        continue;
                    }
                }
            }
            if !visitor(&key[prefix.len()..], &value) {
                break;
            }
        }
        Ok(())
    }
}
