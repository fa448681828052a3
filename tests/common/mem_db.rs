//! A volatile, in-memory [`KVStore`] for tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use pof_rs::store::pluggables::{KVGet, KVStore, WriteBatch};

/// Keys are kept ordered so that tests can count everything under a prefix. Clones share the same map,
/// which lets a test reopen a [`ChainStore`](pof_rs::store::chain_store::ChainStore) over the same data.
#[derive(Clone, Default)]
pub(crate) struct MemDB(Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>);

impl MemDB {
    pub(crate) fn new() -> MemDB {
        MemDB::default()
    }

    /// Count the keys that start with `prefix`.
    pub(crate) fn count_prefix(&self, prefix: &[u8]) -> usize {
        self.0
            .lock()
            .unwrap()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count()
    }
}

impl KVStore for MemDB {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.0 {
            match value {
                Some(value) => map.insert(key, value),
                None => map.remove(&key),
            };
        }
    }
}

impl KVGet for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

/// Operations in the order they were made; a `None` value deletes the key.
pub(crate) struct MemWriteBatch(Vec<(Vec<u8>, Option<Vec<u8>>)>);

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch(Vec::new())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.push((key.to_vec(), Some(value.to_vec())));
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.push((key.to_vec(), None));
    }
}
