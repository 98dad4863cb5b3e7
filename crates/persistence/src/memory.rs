//! In-memory store used by tests and by throwaway pool validation state.

use crate::{prefix_upper_bound, BatchOperation, Result, SeekDirection, Store, WriteBatch};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

/// BTreeMap-backed store with the same ordering guarantees as RocksDB.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().expect("lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map
            .write()
            .expect("lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().expect("lock poisoned").remove(key);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write().expect("lock poisoned");
        for op in batch.into_ops() {
            match op {
                BatchOperation::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn for_each_prefix(
        &self,
        prefix: &[u8],
        direction: SeekDirection,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let map = self.map.read().expect("lock poisoned");
        let upper = match prefix_upper_bound(prefix) {
            Some(bound) => Bound::Excluded(bound),
            None => Bound::Unbounded,
        };
        let range = map.range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), upper));
        match direction {
            SeekDirection::Forward => {
                for (key, value) in range {
                    if !visitor(&key[prefix.len()..], value) {
                        break;
                    }
                }
            }
            SeekDirection::Backward => {
                for (key, value) in range.rev() {
                    if !visitor(&key[prefix.len()..], value) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
