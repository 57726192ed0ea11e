//! In-process backend: command API, change feed and ephemeral relay.
//!
//! Each resource gets a room with one broadcast channel. Committed writes are
//! published as `Change` events to every connection on the room (the author
//! included); presence and cursor messages are relayed to everyone but their
//! sender. Used by tests, benches and demos in place of a real server.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use super::{CommandApi, CommandError, CommandKind};
use crate::model::{ChangeEvent, Collection, EntityId, ResourceId, Row};
use crate::protocol::ChannelMessage;
use crate::transport::{Channel, Transport, TransportError};

type Table = BTreeMap<EntityId, Row>;

/// Origin id for messages produced by the backend itself.
const SERVER_ORIGIN: u64 = 0;

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    msg: ChannelMessage,
}

/// A broadcast group for one resource.
struct Room {
    sender: broadcast::Sender<Envelope>,
    kill: broadcast::Sender<()>,
    connections: AtomicUsize,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (kill, _) = broadcast::channel(1);
        Self { sender, kill, connections: AtomicUsize::new(0) }
    }
}

struct Inner {
    tables: Mutex<HashMap<(ResourceId, Collection), Table>>,
    rooms: Mutex<HashMap<ResourceId, Arc<Room>>>,
    next_id: AtomicU64,
    next_connection: AtomicU64,
    offline: AtomicBool,
    failures: Mutex<HashMap<CommandKind, VecDeque<CommandError>>>,
    counts: Mutex<HashMap<CommandKind, usize>>,
    latency: Mutex<Duration>,
    capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory backend. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` bounds each room's broadcast buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(HashMap::new()),
                rooms: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_connection: AtomicU64::new(SERVER_ORIGIN + 1),
                offline: AtomicBool::new(false),
                failures: Mutex::new(HashMap::new()),
                counts: Mutex::new(HashMap::new()),
                latency: Mutex::new(Duration::ZERO),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Server ids are `srv-{n}`, counting from `start`.
    pub fn with_id_start(self, start: u64) -> Self {
        self.inner.next_id.store(start, Ordering::SeqCst);
        self
    }

    fn room(&self, resource: &ResourceId) -> Arc<Room> {
        lock(&self.inner.rooms)
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(Room::new(self.inner.capacity)))
            .clone()
    }

    // ─── Test controls ──────────────────────────────────────────

    /// Refuse new connections while `true`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Sever every live connection on a resource.
    pub fn drop_connections(&self, resource: &ResourceId) {
        let _ = self.room(resource).kill.send(());
    }

    pub fn connection_count(&self, resource: &ResourceId) -> usize {
        lock(&self.inner.rooms)
            .get(resource)
            .map_or(0, |room| room.connections.load(Ordering::SeqCst))
    }

    /// Make the next command of `kind` fail with `error`.
    pub fn fail_next(&self, kind: CommandKind, error: CommandError) {
        lock(&self.inner.failures).entry(kind).or_default().push_back(error);
    }

    /// Delay every command by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// How many commands of `kind` were received (failed ones included).
    pub fn command_count(&self, kind: CommandKind) -> usize {
        lock(&self.inner.counts).get(&kind).copied().unwrap_or(0)
    }

    /// Publish a message to every connection on a resource, as the server.
    pub fn inject(&self, resource: &ResourceId, msg: ChannelMessage) {
        let _ = self.room(resource).sender.send(Envelope { origin: SERVER_ORIGIN, msg });
    }

    /// Insert rows without emitting change events.
    pub fn seed(&self, resource: &ResourceId, collection: &Collection, rows: Vec<Row>) {
        let mut tables = lock(&self.inner.tables);
        let table = tables.entry((resource.clone(), collection.clone())).or_default();
        for row in rows {
            if let Some(id) = row.id() {
                table.insert(id, row);
            }
        }
    }

    pub fn row(&self, resource: &ResourceId, collection: &Collection, id: &EntityId) -> Option<Row> {
        lock(&self.inner.tables)
            .get(&(resource.clone(), collection.clone()))
            .and_then(|table| table.get(id).cloned())
    }

    pub fn rows(&self, resource: &ResourceId, collection: &Collection) -> Vec<Row> {
        lock(&self.inner.tables)
            .get(&(resource.clone(), collection.clone()))
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    // ─── Command plumbing ───────────────────────────────────────

    async fn begin(&self, kind: CommandKind) -> Result<(), CommandError> {
        *lock(&self.inner.counts).entry(kind).or_default() += 1;
        let latency = *lock(&self.inner.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let injected = lock(&self.inner.failures).get_mut(&kind).and_then(VecDeque::pop_front);
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn publish(&self, resource: &ResourceId, event: ChangeEvent) {
        log::trace!("{resource}: {:?} in {}", event.kind, event.collection);
        self.inject(resource, ChannelMessage::Change(event));
    }
}

impl CommandApi for MemoryBackend {
    async fn create(
        &self,
        resource: &ResourceId,
        collection: &Collection,
        mut row: Row,
    ) -> Result<Row, CommandError> {
        self.begin(CommandKind::Create).await?;
        let id = EntityId::new(format!("srv-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst)));
        row.set_id(&id);
        lock(&self.inner.tables)
            .entry((resource.clone(), collection.clone()))
            .or_default()
            .insert(id, row.clone());
        self.publish(resource, ChangeEvent::insert(collection.clone(), row.clone()));
        Ok(row)
    }

    async fn update(
        &self,
        resource: &ResourceId,
        collection: &Collection,
        id: &EntityId,
        patch: Row,
    ) -> Result<Row, CommandError> {
        self.begin(CommandKind::Update).await?;
        let (previous, updated) = {
            let mut tables = lock(&self.inner.tables);
            let slot = tables
                .get_mut(&(resource.clone(), collection.clone()))
                .and_then(|table| table.get_mut(id))
                .ok_or_else(|| CommandError::NotFound(id.clone()))?;
            let previous = slot.clone();
            *slot = previous.merged(&patch);
            (previous, slot.clone())
        };
        self.publish(resource, ChangeEvent::update(collection.clone(), updated.clone(), Some(previous)));
        Ok(updated)
    }

    async fn delete(
        &self,
        resource: &ResourceId,
        collection: &Collection,
        id: &EntityId,
    ) -> Result<(), CommandError> {
        self.begin(CommandKind::Delete).await?;
        let removed = lock(&self.inner.tables)
            .get_mut(&(resource.clone(), collection.clone()))
            .and_then(|table| table.remove(id))
            .ok_or_else(|| CommandError::NotFound(id.clone()))?;
        self.publish(resource, ChangeEvent::delete(collection.clone(), removed));
        Ok(())
    }

    async fn fetch_all(
        &self,
        resource: &ResourceId,
        collection: &Collection,
    ) -> Result<Vec<Row>, CommandError> {
        self.begin(CommandKind::Fetch).await?;
        Ok(self.rows(resource, collection))
    }
}

impl Transport for MemoryBackend {
    async fn connect(&self, resource: &ResourceId) -> Result<Channel, TransportError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("backend offline".to_string()));
        }
        let room = self.room(resource);
        let origin = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(self.inner.capacity);
        let (in_tx, in_rx) = mpsc::channel(self.inner.capacity);

        room.connections.fetch_add(1, Ordering::SeqCst);
        let feed = room.sender.subscribe();
        let kill = room.kill.subscribe();
        tokio::spawn(relay(room, origin, feed, kill, out_rx, in_tx));
        log::debug!("Memory connection {origin} joined {resource}");

        Ok(Channel { outgoing: out_tx, incoming: in_rx })
    }
}

/// Per-connection pump between the room and one client.
async fn relay(
    room: Arc<Room>,
    origin: u64,
    mut feed: broadcast::Receiver<Envelope>,
    mut kill: broadcast::Receiver<()>,
    mut from_client: mpsc::Receiver<ChannelMessage>,
    to_client: mpsc::Sender<ChannelMessage>,
) {
    loop {
        tokio::select! {
            envelope = feed.recv() => match envelope {
                Ok(envelope) if envelope.origin != origin => {
                    if to_client.send(envelope.msg).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Connection {origin} lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = from_client.recv() => match msg {
                Some(msg) if msg.is_ephemeral() => {
                    let _ = room.sender.send(Envelope { origin, msg });
                }
                Some(ChannelMessage::Ping) => {
                    let _ = to_client.send(ChannelMessage::Pong).await;
                }
                Some(_) => {}
                None => break,
            },
            _ = kill.recv() => break,
        }
    }
    room.connections.fetch_sub(1, Ordering::SeqCst);
}
