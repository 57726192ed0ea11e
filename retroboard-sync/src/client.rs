//! The façade the UI layer talks to: one [`BoardClient`] per open board.
//!
//! Wires a connection, the reconciler, the mutation engine, presence and
//! cursors around a single shared cache.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::CommandApi;
use crate::cache::{CacheNotification, CollectionSnapshot, LocalCache};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connection::{ConnectionError, ConnectionHandle, ConnectionManager, ConnectionState};
use crate::cursor::{ContainerBounds, CursorBroadcaster, CursorEntry, CursorMap, CursorTracker};
use crate::model::{Collection, EntityId, Identity, ResourceId, Row};
use crate::mutation::{Commit, MutationEngine, MutationError, PendingCreate, UndoHandle};
use crate::presence::{PresenceSession, PresenceState, PresenceTracker, RosterView};
use crate::reconcile::{CollectionFeed, Reconciler};
use crate::storage::PendingDeletionStore;
use crate::transport::Transport;

pub struct BoardClient<B: Transport + CommandApi> {
    resource: ResourceId,
    identity: Identity,
    manager: ConnectionManager<B>,
    connection: ConnectionHandle,
    cache: LocalCache,
    reconciler: Arc<Reconciler>,
    reconcile_task: JoinHandle<()>,
    mutations: MutationEngine<B>,
    presence: Option<PresenceSession>,
    cursors: CursorTracker,
    resumed: Mutex<Vec<UndoHandle>>,
}

impl<B: Transport + CommandApi> BoardClient<B> {
    /// Open a board. Must run inside a tokio runtime.
    ///
    /// Deletions left pending by a previous session are resumed immediately;
    /// collect the ones still undoable with [`take_resumed_undos`](Self::take_resumed_undos).
    /// Pointer positions are mapped into `container`, the board element's
    /// client rectangle; update it with [`set_cursor_container`](Self::set_cursor_container).
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        backend: Arc<B>,
        resource: ResourceId,
        identity: Identity,
        store: Arc<dyn PendingDeletionStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        container: ContainerBounds,
    ) -> Self {
        let cache = LocalCache::new(config.channel_capacity);
        let manager = ConnectionManager::new(backend.clone(), config.reconnect.clone(), config.channel_capacity);
        let connection = manager.open(&resource);

        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            config.reconcile.clone(),
            config.correlation.clone(),
        ));
        for collection in &config.collections {
            reconciler.track(collection.clone(), |_| true);
        }

        let mutations = MutationEngine::new(
            resource.clone(),
            identity.user_id.clone(),
            cache.clone(),
            backend.clone(),
            store,
            clock.clone(),
            config.mutation.clone(),
            config.correlation.clone(),
        );
        let resumed = mutations.resume_pending();

        let reconcile_task = reconciler.spawn(connection.port(), backend);
        let presence = PresenceTracker::new(config.presence.clone(), clock).join(connection.port(), &identity);
        let cursors = CursorBroadcaster::new(config.cursor.clone()).track(connection.port(), &identity, container);

        log::info!("Opened board {resource} as {}", identity.display_name);
        Self {
            resource,
            identity,
            manager,
            connection,
            cache,
            reconciler,
            reconcile_task,
            mutations,
            presence: Some(presence),
            cursors,
            resumed: Mutex::new(resumed),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    // ─── Collections ──────────────────────────────────────────────────

    pub fn collection(&self, collection: &Collection) -> CollectionSnapshot {
        self.cache.snapshot(collection)
    }

    pub fn watch_cache(&self) -> broadcast::Receiver<CacheNotification> {
        self.cache.subscribe()
    }

    /// Typed change stream for a filtered view of a collection.
    pub fn subscribe<F>(&self, collection: Collection, predicate: F) -> CollectionFeed
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.reconciler.subscribe(collection, predicate)
    }

    // ─── Mutations ────────────────────────────────────────────────────

    pub fn create(&self, collection: &Collection, input: Row) -> PendingCreate {
        self.mutations.create(collection, input)
    }

    pub fn update(&self, collection: &Collection, id: &EntityId, patch: Row) -> Commit<Row> {
        self.mutations.update(collection, id, patch)
    }

    pub fn remove(
        &self,
        collection: &Collection,
        id: &EntityId,
        parent_id: Option<EntityId>,
    ) -> Result<UndoHandle, MutationError> {
        self.mutations.remove(collection, id, parent_id)
    }

    /// Undo offers restored from the previous session. Drains on first call.
    pub fn take_resumed_undos(&self) -> Vec<UndoHandle> {
        std::mem::take(&mut *self.resumed.lock().unwrap_or_else(PoisonError::into_inner))
    }

    // ─── Presence & cursors ───────────────────────────────────────────

    pub fn roster(&self) -> RosterView {
        self.presence.as_ref().map(PresenceSession::roster).unwrap_or_default()
    }

    pub fn watch_roster(&self) -> Option<watch::Receiver<RosterView>> {
        self.presence.as_ref().map(PresenceSession::watch)
    }

    pub fn update_self(&self, state: PresenceState) {
        if let Some(presence) = &self.presence {
            presence.update_self(state);
        }
    }

    pub fn cursors(&self) -> Vec<CursorEntry> {
        self.cursors.cursors()
    }

    pub fn watch_cursors(&self) -> watch::Receiver<CursorMap> {
        self.cursors.watch()
    }

    pub fn update_cursor(&self, client_x: f32, client_y: f32) {
        self.cursors.update_cursor(client_x, client_y);
    }

    pub fn pointer_left(&self) {
        self.cursors.pointer_left();
    }

    pub fn set_cursor_container(&self, bounds: ContainerBounds) {
        self.cursors.set_container(bounds);
    }

    // ─── Connection ───────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state(&self.connection)
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.manager.reconnect(&self.connection).await
    }

    /// Leave presence and tear everything down. Pending deletions keep
    /// their schedule.
    pub async fn close(mut self) {
        if let Some(presence) = self.presence.take() {
            presence.leave().await;
        }
        log::info!("Closing board {}", self.resource);
    }
}

impl<B: Transport + CommandApi> Drop for BoardClient<B> {
    fn drop(&mut self) {
        self.reconcile_task.abort();
        self.manager.close(&self.connection);
    }
}
