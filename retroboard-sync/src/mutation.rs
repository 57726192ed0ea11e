//! Optimistic writes and the deletion undo window.
//!
//! ```text
//! create ──► temp row in cache ──► CommandApi::create ──┬─ ok:  swap temp for server row
//!                                                       └─ err: drop temp row
//! update ──► patch cache (keep snapshot) ──► update ────┬─ ok:  store server row
//!                                                       └─ err: put snapshot back
//! remove ──► hide + drop row, persist PendingDeletion
//!              │
//!              ├─ undo() before deadline ──► restore row, forget record
//!              └─ deadline / cancel_undo() ──► CommandApi::delete
//!                                                ├─ ok:  forget record
//!                                                └─ err: restore row, forget record
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::backend::{CommandApi, CommandError};
use crate::cache::LocalCache;
use crate::clock::Clock;
use crate::config::{CorrelationRule, MutationConfig};
use crate::model::{Collection, EntityId, FieldValue, PendingDeletion, ResourceId, Row, UserId, ID_FIELD};
use crate::storage::PendingDeletionStore;

/// Field stamped with the creating user's id.
pub const AUTHOR_FIELD: &str = "author_id";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("Could not {op} the item: {source}")]
    Command {
        op: &'static str,
        #[source]
        source: CommandError,
    },
    #[error("Item {0} no longer exists")]
    NotFound(EntityId),
    #[error("Item {0} is still being saved")]
    Unconfirmed(EntityId),
    #[error("The operation was interrupted")]
    Aborted,
}

impl MutationError {
    fn command(op: &'static str, source: CommandError) -> Self {
        MutationError::Command { op, source }
    }
}

// ───────────────────────────────────────────────────────────────────
// Correlation
// ───────────────────────────────────────────────────────────────────

impl CorrelationRule {
    /// Whether `server` is the authoritative version of the optimistic row `temp`.
    pub fn correlates(&self, temp: &Row, server: &Row) -> bool {
        if let (Some(a), Some(b)) = (temp.get(&self.ref_field), server.get(&self.ref_field)) {
            // Temp ids are only unique per client.
            let same_author = match (temp.get(AUTHOR_FIELD), server.get(AUTHOR_FIELD)) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            };
            return a == b && same_author;
        }

        let mut any_content = false;
        for field in &self.content_fields {
            match (temp.get(field), server.get(field)) {
                (Some(a), Some(b)) if a == b => any_content = true,
                (None, None) => {}
                _ => return false,
            }
        }
        if !any_content {
            return false;
        }

        match (
            temp.get(&self.time_field).and_then(FieldValue::as_i64),
            server.get(&self.time_field).and_then(FieldValue::as_i64),
        ) {
            (Some(a), Some(b)) => a.abs_diff(b) <= self.window_ms,
            _ => false,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Commit futures
// ───────────────────────────────────────────────────────────────────

enum CommitInner<T> {
    Ready(Option<Result<T, MutationError>>),
    Running(JoinHandle<Result<T, MutationError>>),
}

/// Resolves once the server has accepted or rejected a write.
///
/// The local cache has already been updated when this is returned; awaiting
/// it is optional.
pub struct Commit<T> {
    inner: CommitInner<T>,
}

impl<T> Commit<T> {
    fn ready(result: Result<T, MutationError>) -> Self {
        Self { inner: CommitInner::Ready(Some(result)) }
    }

    fn running(handle: JoinHandle<Result<T, MutationError>>) -> Self {
        Self { inner: CommitInner::Running(handle) }
    }
}

// Nothing inside is structurally pinned.
impl<T> Unpin for Commit<T> {}

impl<T> Future for Commit<T> {
    type Output = Result<T, MutationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            CommitInner::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(MutationError::Aborted))),
            CommitInner::Running(handle) => Pin::new(handle)
                .poll(cx)
                .map(|joined| joined.unwrap_or(Err(MutationError::Aborted))),
        }
    }
}

/// Result of [`MutationEngine::create`].
pub struct PendingCreate {
    /// Id of the optimistic row, valid until the server row replaces it.
    pub temp_id: EntityId,
    pub commit: Commit<Row>,
}

// ───────────────────────────────────────────────────────────────────
// Deletions
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DeletionOutcome {
    Undone,
    Committed,
    Failed(MutationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    CommitRequested,
    Undone,
    Committing,
    Settled,
}

struct DeletionShared {
    record: PendingDeletion,
    phase: Mutex<Phase>,
    wake: Notify,
    outcome: watch::Sender<Option<DeletionOutcome>>,
    cache: LocalCache,
    store: Arc<dyn PendingDeletionStore>,
}

impl DeletionShared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_record(&self) {
        if let Err(e) = self.store.remove(&self.record.entity_id) {
            log::warn!("Could not clear pending deletion {}: {e}", self.record.entity_id);
        }
    }

    fn deleted_elsewhere(&self) -> bool {
        self.cache.is_gone(&self.record.collection, &self.record.entity_id)
    }

    fn settle_deleted_elsewhere(&self) {
        self.forget_record();
        self.cache.unsuppress(&self.record.collection, &self.record.entity_id);
        log::debug!("{} was already deleted on the server", self.record.entity_id);
        self.settle(DeletionOutcome::Committed);
    }

    fn restore_row(&self) {
        self.cache.restore(&self.record.collection, self.record.snapshot.clone());
    }

    fn settle(&self, outcome: DeletionOutcome) {
        *self.phase() = Phase::Settled;
        self.outcome.send_replace(Some(outcome));
    }
}

/// A deletion inside its undo window.
///
/// Dropping the handle does not cancel anything: the delete still commits
/// when the window closes.
pub struct UndoHandle {
    shared: Arc<DeletionShared>,
}

impl UndoHandle {
    pub fn entity_id(&self) -> &EntityId {
        &self.shared.record.entity_id
    }

    pub fn record(&self) -> &PendingDeletion {
        &self.shared.record
    }

    /// Whether undo is still possible.
    pub fn is_pending(&self) -> bool {
        *self.shared.phase() == Phase::Pending
    }

    /// Restore the row and cancel the remote delete.
    ///
    /// Returns `false` (and does nothing) once the window has closed, the
    /// offer was dismissed, or the deletion was already undone. A row that
    /// another client deleted meanwhile is not brought back: the deletion
    /// settles as committed and this returns `false`.
    pub fn undo(&self) -> bool {
        {
            let mut phase = self.shared.phase();
            if *phase != Phase::Pending {
                return false;
            }
            if self.shared.deleted_elsewhere() {
                *phase = Phase::Committing;
                drop(phase);
                self.shared.wake.notify_one();
                self.shared.settle_deleted_elsewhere();
                return false;
            }
            *phase = Phase::Undone;
        }
        self.shared.wake.notify_one();
        self.shared.forget_record();
        self.shared.restore_row();
        log::debug!("Deletion of {} undone", self.shared.record.entity_id);
        self.shared.settle(DeletionOutcome::Undone);
        true
    }

    /// Dismiss the undo offer and delete right away.
    pub fn cancel_undo(&self) -> bool {
        {
            let mut phase = self.shared.phase();
            if *phase != Phase::Pending {
                return false;
            }
            *phase = Phase::CommitRequested;
        }
        self.shared.wake.notify_one();
        true
    }

    /// Outcome so far, if settled.
    pub fn outcome(&self) -> Option<DeletionOutcome> {
        self.shared.outcome.borrow().clone()
    }

    /// Wait until the deletion is undone, committed or failed.
    pub async fn settled(&self) -> DeletionOutcome {
        let mut rx = self.shared.outcome.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
        match result {
            Ok(Some(outcome)) => outcome,
            _ => DeletionOutcome::Failed(MutationError::Aborted),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Engine
// ───────────────────────────────────────────────────────────────────

struct EngineInner<C> {
    resource: ResourceId,
    cache: LocalCache,
    api: Arc<C>,
    store: Arc<dyn PendingDeletionStore>,
    clock: Arc<dyn Clock>,
    author: UserId,
    config: MutationConfig,
    correlation: CorrelationRule,
    last_temp: Mutex<(u64, u32)>,
}

/// Optimistic create/update/delete for one resource.
pub struct MutationEngine<C: CommandApi> {
    inner: Arc<EngineInner<C>>,
}

impl<C: CommandApi> Clone for MutationEngine<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: CommandApi> MutationEngine<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource: ResourceId,
        author: UserId,
        cache: LocalCache,
        api: Arc<C>,
        store: Arc<dyn PendingDeletionStore>,
        clock: Arc<dyn Clock>,
        config: MutationConfig,
        correlation: CorrelationRule,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                resource,
                cache,
                api,
                store,
                clock,
                author,
                config,
                correlation,
                last_temp: Mutex::new((0, 0)),
            }),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.inner.resource
    }

    fn mint_temp_id(&self, now_ms: u64) -> EntityId {
        let mut last = self.inner.last_temp.lock().unwrap_or_else(PoisonError::into_inner);
        // A clock that steps backwards keeps counting from the newest stamp.
        let stamp = now_ms.max(last.0);
        let seq = if last.0 == stamp { last.1 + 1 } else { 0 };
        *last = (stamp, seq);
        EntityId::temporary(stamp, seq)
    }

    /// Insert a row locally right away and create it on the server.
    pub fn create(&self, collection: &Collection, input: Row) -> PendingCreate {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let temp_id = self.mint_temp_id(now);

        let mut row = input;
        row.set_id(&temp_id);
        if !row.contains(AUTHOR_FIELD) {
            row.set(AUTHOR_FIELD, inner.author.as_str());
        }
        if !row.contains(&inner.correlation.time_field) {
            row.set(inner.correlation.time_field.clone(), now as i64);
        }
        row.set(inner.correlation.ref_field.clone(), temp_id.as_str());
        inner.cache.upsert(collection, row.clone());

        let mut payload = row;
        payload.remove(ID_FIELD);

        let inner = inner.clone();
        let collection = collection.clone();
        let task_temp = temp_id.clone();
        let handle = tokio::spawn(async move {
            match inner.api.create(&inner.resource, &collection, payload).await {
                Ok(server_row) => {
                    if inner.cache.contains(&collection, &task_temp) {
                        inner.cache.replace(&collection, &task_temp, server_row.clone());
                    } else if let Some(id) = server_row.id() {
                        // The change feed got here first and already swapped the row.
                        if !inner.cache.contains(&collection, &id) {
                            inner.cache.upsert(&collection, server_row.clone());
                        }
                    }
                    Ok(server_row)
                }
                Err(e) => {
                    log::warn!("Create in {collection} failed: {e}");
                    inner.cache.remove(&collection, &task_temp);
                    Err(MutationError::command("create", e))
                }
            }
        });

        PendingCreate { temp_id, commit: Commit::running(handle) }
    }

    /// Patch a row locally right away and on the server.
    pub fn update(&self, collection: &Collection, id: &EntityId, patch: Row) -> Commit<Row> {
        if id.is_temporary() {
            return Commit::ready(Err(MutationError::Unconfirmed(id.clone())));
        }
        let inner = &self.inner;
        let Some(snapshot) = inner.cache.get(collection, id) else {
            return Commit::ready(Err(MutationError::NotFound(id.clone())));
        };
        inner.cache.upsert(collection, snapshot.merged(&patch));

        let inner = inner.clone();
        let collection = collection.clone();
        let id = id.clone();
        Commit::running(tokio::spawn(async move {
            match inner.api.update(&inner.resource, &collection, &id, patch).await {
                Ok(server_row) => {
                    inner.cache.overwrite_existing(&collection, server_row.clone());
                    Ok(server_row)
                }
                Err(e) => {
                    log::warn!("Update of {id} failed, rolling back: {e}");
                    inner.cache.overwrite_existing(&collection, snapshot);
                    Err(MutationError::command("update", e))
                }
            }
        }))
    }

    /// Remove a row locally and schedule the remote delete after the undo window.
    pub fn remove(
        &self,
        collection: &Collection,
        id: &EntityId,
        parent_id: Option<EntityId>,
    ) -> Result<UndoHandle, MutationError> {
        if id.is_temporary() {
            return Err(MutationError::Unconfirmed(id.clone()));
        }
        let inner = &self.inner;
        let snapshot = inner
            .cache
            .get(collection, id)
            .ok_or_else(|| MutationError::NotFound(id.clone()))?;

        inner.cache.suppress(collection, id);
        inner.cache.remove(collection, id);

        let window = inner.config.undo_window;
        let record = PendingDeletion {
            entity_id: id.clone(),
            resource_id: inner.resource.clone(),
            collection: collection.clone(),
            parent_id,
            snapshot,
            scheduled_at: inner.clock.now_ms() + window.as_millis() as u64,
        };
        if let Err(e) = inner.store.save(&record) {
            log::warn!("Could not persist pending deletion {id}: {e}");
        }
        Ok(self.arm(record, window))
    }

    /// Replay durable deletions for this resource after a restart.
    ///
    /// Expired ones are committed silently; the rest are hidden again and
    /// re-offered for their remaining time.
    pub fn resume_pending(&self) -> Vec<UndoHandle> {
        let inner = &self.inner;
        let records = match inner.store.load_all() {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Could not load pending deletions: {e}");
                return Vec::new();
            }
        };
        let now = inner.clock.now_ms();
        let mut handles = Vec::new();

        for record in records.into_iter().filter(|r| r.resource_id == inner.resource) {
            inner.cache.suppress(&record.collection, &record.entity_id);
            inner.cache.remove(&record.collection, &record.entity_id);

            if record.is_due(now) {
                if let Err(e) = inner.store.remove(&record.entity_id) {
                    log::warn!("Could not clear pending deletion {}: {e}", record.entity_id);
                }
                let task_inner = inner.clone();
                tokio::spawn(async move {
                    match delete_remote(&task_inner, &record).await {
                        Ok(()) => task_inner.cache.unsuppress(&record.collection, &record.entity_id),
                        Err(e) => {
                            log::warn!("Overdue delete of {} failed: {e}", record.entity_id);
                            task_inner.cache.restore(&record.collection, record.snapshot.clone());
                        }
                    }
                });
            } else {
                let remaining = Duration::from_millis(record.remaining_ms(now));
                log::info!("Re-offering undo for {} ({remaining:?} left)", record.entity_id);
                handles.push(self.arm(record, remaining));
            }
        }
        handles
    }

    fn arm(&self, record: PendingDeletion, delay: Duration) -> UndoHandle {
        let (outcome, _) = watch::channel(None);
        let shared = Arc::new(DeletionShared {
            record,
            phase: Mutex::new(Phase::Pending),
            wake: Notify::new(),
            outcome,
            cache: self.inner.cache.clone(),
            store: self.inner.store.clone(),
        });
        tokio::spawn(run_deletion(self.inner.clone(), shared.clone(), delay));
        UndoHandle { shared }
    }
}

async fn delete_remote<C: CommandApi>(
    inner: &EngineInner<C>,
    record: &PendingDeletion,
) -> Result<(), CommandError> {
    match inner
        .api
        .delete(&record.resource_id, &record.collection, &record.entity_id)
        .await
    {
        // Someone else got there first; the row is gone either way.
        Ok(()) | Err(CommandError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn run_deletion<C: CommandApi>(inner: Arc<EngineInner<C>>, shared: Arc<DeletionShared>, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shared.wake.notified() => {}
    }

    {
        let mut phase = shared.phase();
        match *phase {
            Phase::Pending | Phase::CommitRequested => *phase = Phase::Committing,
            _ => return,
        }
    }

    if shared.deleted_elsewhere() {
        shared.settle_deleted_elsewhere();
        return;
    }

    let entity_id = &shared.record.entity_id;
    match delete_remote(&inner, &shared.record).await {
        Ok(()) => {
            shared.forget_record();
            inner.cache.unsuppress(&shared.record.collection, entity_id);
            log::debug!("Deletion of {entity_id} committed");
            shared.settle(DeletionOutcome::Committed);
        }
        Err(e) => {
            log::warn!("Delete of {entity_id} failed, restoring: {e}");
            shared.restore_row();
            shared.forget_record();
            shared.settle(DeletionOutcome::Failed(MutationError::command("delete", e)));
        }
    }
}
