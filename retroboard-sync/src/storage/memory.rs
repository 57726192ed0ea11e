//! Volatile [`PendingDeletionStore`], shareable between engines to simulate a
//! reload without touching disk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{PendingDeletionStore, StoreError};
use crate::model::{EntityId, PendingDeletion};

#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    records: Mutex<BTreeMap<EntityId, PendingDeletion>>,
    fail_writes: AtomicBool,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `save` and `remove` fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<PendingDeletion> {
        self.records().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<EntityId, PendingDeletion>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PendingDeletionStore for MemoryPendingStore {
    fn save(&self, record: &PendingDeletion) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records().insert(record.entity_id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, entity_id: &EntityId) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records().remove(entity_id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PendingDeletion>, StoreError> {
        Ok(self.records().values().cloned().collect())
    }
}
