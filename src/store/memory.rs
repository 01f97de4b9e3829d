use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{PutMode, PutOutcome, SharedStore, StoreKey, StoreResult};
use crate::error::StoreError;

/// In-process store. Clones share the same entries.
///
/// Every mutation is a single map operation, so a poisoned lock is recovered.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<StoreKey, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<StoreKey> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<StoreKey, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedStore for MemoryStore {
    fn put(&self, key: &StoreKey, data: &[u8], mode: PutMode) -> StoreResult<PutOutcome> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(existing) if mode == PutMode::Idempotent && existing.as_slice() == data => {
                Ok(PutOutcome::Unchanged)
            }
            Some(_) => Err(StoreError::KeyExists(key.to_string())),
            None => {
                entries.insert(key.clone(), data.to_vec());
                Ok(PutOutcome::Created)
            }
        }
    }

    fn get(&self, key: &StoreKey) -> StoreResult<Vec<u8>> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list(&self, dir: Option<&StoreKey>) -> StoreResult<Vec<StoreKey>> {
        let wanted = dir.map(StoreKey::as_str);
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.parent() == wanted)
            .cloned()
            .collect())
    }

    fn remove(&self, key: &StoreKey) -> StoreResult<()> {
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
