//! Local reactive cache: one keyed row set per collection.
//!
//! Written by exactly two parties, the mutation engine and the reconciler.
//! Each operation takes the write lock once and never across an `.await`,
//! so a collection never observes a half-applied change. Every effective
//! write is announced on a broadcast channel for dependent views.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::model::{Collection, EntityId, Row};

/// What happened to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Upserted(EntityId),
    Removed(EntityId),
    /// Server rows were replaced wholesale by a fetch.
    Reloaded,
    /// A fetch started or failed; see the snapshot's `loading`/`error`.
    LoadState,
}

/// Notification sent to cache subscribers after an effective write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotification {
    pub collection: Collection,
    pub change: CacheChange,
    pub version: u64,
}

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Inserted,
    Updated,
    /// The stored row already equals the incoming one.
    Unchanged,
    /// The id is hidden by a pending deletion.
    Suppressed,
    /// The row carries no id.
    MissingId,
}

impl CacheWrite {
    pub fn is_effective(self) -> bool {
        matches!(self, CacheWrite::Inserted | CacheWrite::Updated)
    }
}

/// Point-in-time view of a collection, as handed to the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSnapshot {
    pub rows: Vec<Row>,
    pub loading: bool,
    pub error: Option<String>,
    pub version: u64,
}

impl CollectionSnapshot {
    pub fn find(&self, id: &EntityId) -> Option<&Row> {
        self.rows.iter().find(|row| row.id().as_ref() == Some(id))
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    rows: BTreeMap<EntityId, Row>,
    hidden: HashSet<EntityId>,
    /// Hidden ids the server has already deleted on someone else's behalf.
    gone: HashSet<EntityId>,
    loading: bool,
    error: Option<String>,
    version: u64,
}

/// Shared handle to the cache. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct LocalCache {
    collections: Arc<RwLock<HashMap<Collection, CollectionState>>>,
    notify: broadcast::Sender<CacheNotification>,
}

impl LocalCache {
    /// Create an empty cache whose notification channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(capacity.max(1));
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            notify,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheNotification> {
        self.notify.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Collection, CollectionState>> {
        self.collections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Collection, CollectionState>> {
        self.collections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, collection: &Collection, change: CacheChange, version: u64) {
        // No receivers is fine: nobody is rendering this collection.
        let _ = self.notify.send(CacheNotification {
            collection: collection.clone(),
            change,
            version,
        });
    }

    /// Current rows plus loading/error flags.
    pub fn snapshot(&self, collection: &Collection) -> CollectionSnapshot {
        let guard = self.read();
        match guard.get(collection) {
            Some(state) => CollectionSnapshot {
                rows: state.rows.values().cloned().collect(),
                loading: state.loading,
                error: state.error.clone(),
                version: state.version,
            },
            None => CollectionSnapshot::default(),
        }
    }

    pub fn get(&self, collection: &Collection, id: &EntityId) -> Option<Row> {
        self.read().get(collection)?.rows.get(id).cloned()
    }

    pub fn contains(&self, collection: &Collection, id: &EntityId) -> bool {
        self.read()
            .get(collection)
            .is_some_and(|state| state.rows.contains_key(id))
    }

    pub fn len(&self, collection: &Collection) -> usize {
        self.read().get(collection).map_or(0, |state| state.rows.len())
    }

    /// Rows still carrying a temporary id.
    pub fn temporary_rows(&self, collection: &Collection) -> Vec<Row> {
        self.read()
            .get(collection)
            .map(|state| {
                state
                    .rows
                    .iter()
                    .filter(|(id, _)| id.is_temporary())
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or overwrite a row by id.
    pub fn upsert(&self, collection: &Collection, row: Row) -> CacheWrite {
        let Some(id) = row.id() else {
            return CacheWrite::MissingId;
        };
        let (outcome, version) = {
            let mut guard = self.write();
            let state = guard.entry(collection.clone()).or_default();
            if state.hidden.contains(&id) {
                return CacheWrite::Suppressed;
            }
            let outcome = match state.rows.get(&id) {
                Some(existing) if *existing == row => return CacheWrite::Unchanged,
                Some(_) => CacheWrite::Updated,
                None => CacheWrite::Inserted,
            };
            state.rows.insert(id.clone(), row);
            state.version += 1;
            (outcome, state.version)
        };
        self.announce(collection, CacheChange::Upserted(id), version);
        outcome
    }

    /// Remove a row; returns it if it was present.
    pub fn remove(&self, collection: &Collection, id: &EntityId) -> Option<Row> {
        let (removed, version) = {
            let mut guard = self.write();
            let state = guard.get_mut(collection)?;
            let removed = state.rows.remove(id)?;
            state.version += 1;
            (removed, state.version)
        };
        self.announce(collection, CacheChange::Removed(id.clone()), version);
        Some(removed)
    }

    /// Swap the row stored under `old_id` for `row` in one write.
    ///
    /// Used when the authoritative row for an optimistic insert arrives.
    pub fn replace(&self, collection: &Collection, old_id: &EntityId, row: Row) -> CacheWrite {
        let Some(new_id) = row.id() else {
            return CacheWrite::MissingId;
        };
        let (removed_old, outcome, version) = {
            let mut guard = self.write();
            let state = guard.entry(collection.clone()).or_default();
            let removed_old = *old_id != new_id && state.rows.remove(old_id).is_some();
            let outcome = if state.hidden.contains(&new_id) {
                CacheWrite::Suppressed
            } else {
                match state.rows.get(&new_id) {
                    Some(existing) if *existing == row => CacheWrite::Unchanged,
                    Some(_) => CacheWrite::Updated,
                    None => CacheWrite::Inserted,
                }
            };
            if outcome.is_effective() {
                state.rows.insert(new_id.clone(), row);
            }
            if removed_old || outcome.is_effective() {
                state.version += 1;
            }
            (removed_old, outcome, state.version)
        };
        if removed_old {
            self.announce(collection, CacheChange::Removed(old_id.clone()), version);
        }
        if outcome.is_effective() {
            self.announce(collection, CacheChange::Upserted(new_id), version);
        }
        outcome
    }

    /// Overwrite a row only if it is still present. Returns whether it was.
    pub fn overwrite_existing(&self, collection: &Collection, row: Row) -> bool {
        let Some(id) = row.id() else {
            return false;
        };
        let version = {
            let mut guard = self.write();
            let Some(state) = guard.get_mut(collection) else {
                return false;
            };
            match state.rows.get_mut(&id) {
                Some(slot) => {
                    *slot = row;
                    state.version += 1;
                    state.version
                }
                None => return false,
            }
        };
        self.announce(collection, CacheChange::Upserted(id), version);
        true
    }

    /// Hide an id so that feed updates cannot re-materialize it.
    pub fn suppress(&self, collection: &Collection, id: &EntityId) {
        self.write()
            .entry(collection.clone())
            .or_default()
            .hidden
            .insert(id.clone());
    }

    pub fn unsuppress(&self, collection: &Collection, id: &EntityId) {
        if let Some(state) = self.write().get_mut(collection) {
            state.hidden.remove(id);
            state.gone.remove(id);
        }
    }

    /// Record that a hidden id was deleted remotely. Ids that are not hidden
    /// are left alone; returns whether the mark was taken.
    pub fn mark_gone(&self, collection: &Collection, id: &EntityId) -> bool {
        let mut guard = self.write();
        match guard.get_mut(collection) {
            Some(state) if state.hidden.contains(id) => {
                state.gone.insert(id.clone());
                true
            }
            _ => false,
        }
    }

    pub fn is_gone(&self, collection: &Collection, id: &EntityId) -> bool {
        self.read()
            .get(collection)
            .is_some_and(|state| state.gone.contains(id))
    }

    pub fn is_suppressed(&self, collection: &Collection, id: &EntityId) -> bool {
        self.read()
            .get(collection)
            .is_some_and(|state| state.hidden.contains(id))
    }

    /// Unhide an id and put its snapshot back, exactly as given.
    pub fn restore(&self, collection: &Collection, row: Row) {
        let Some(id) = row.id() else {
            return;
        };
        let version = {
            let mut guard = self.write();
            let state = guard.entry(collection.clone()).or_default();
            state.hidden.remove(&id);
            state.gone.remove(&id);
            state.rows.insert(id.clone(), row);
            state.version += 1;
            state.version
        };
        self.announce(collection, CacheChange::Upserted(id), version);
    }

    /// Mark a collection as loading.
    pub fn begin_load(&self, collection: &Collection) {
        let version = {
            let mut guard = self.write();
            let state = guard.entry(collection.clone()).or_default();
            state.loading = true;
            state.version += 1;
            state.version
        };
        self.announce(collection, CacheChange::LoadState, version);
    }

    /// Record a failed fetch; rows are left as they were.
    pub fn fail_load(&self, collection: &Collection, error: impl Into<String>) {
        let version = {
            let mut guard = self.write();
            let state = guard.entry(collection.clone()).or_default();
            state.loading = false;
            state.error = Some(error.into());
            state.version += 1;
            state.version
        };
        self.announce(collection, CacheChange::LoadState, version);
    }

    /// Replace the server rows of a collection with a fresh fetch.
    ///
    /// Temporary rows survive; hidden ids stay hidden.
    pub fn replace_all(&self, collection: &Collection, rows: Vec<Row>) {
        let version = {
            let mut guard = self.write();
            let state = guard.entry(collection.clone()).or_default();
            state.rows.retain(|id, _| id.is_temporary());
            for row in rows {
                let Some(id) = row.id() else { continue };
                if state.hidden.contains(&id) {
                    continue;
                }
                state.rows.insert(id, row);
            }
            state.loading = false;
            state.error = None;
            state.version += 1;
            state.version
        };
        self.announce(collection, CacheChange::Reloaded, version);
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(256)
    }
}
