//! # retroboard-sync — real-time sync core for collaborative boards
//!
//! Keeps a local cache consistent with a multi-writer backend, applies the
//! user's own edits optimistically, offers an undo window for deletions and
//! shares ephemeral presence and cursors.
//!
//! ## Architecture
//!
//! ```text
//!            UI
//!   ┌────────┴─────────────────────────────────────────────┐
//!   │                    BoardClient                       │
//!   └──┬───────────────┬──────────────┬──────────────┬─────┘
//!      │ create/update │ snapshots    │ roster       │ cursors
//!      ▼ /remove       │              │              │
//! ┌──────────────┐     │       ┌──────────────┐ ┌──────────────┐
//! │MutationEngine│     │       │PresenceTrack.│ │CursorBroadc. │
//! └──┬────────┬──┘     │       └──────┬───────┘ └──────┬───────┘
//!    │        ▼        ▼              │                │
//!    │   ┌──────────────────┐         │  ephemeral     │
//!    │   │    LocalCache    │◄──┐     │  messages      │
//!    │   └──────────────────┘   │     ▼                ▼
//!    │                    ┌─────┴────────────────────────────┐
//!    │ CommandApi         │ Reconciler ◄── ConnectionManager │
//!    ▼                    └──────────────────────┬───────────┘
//! ┌────────────────┐                             │ Transport
//! │    backend     │◄────────────────────────────┘ (WebSocket / memory)
//! └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`] / [`transport`] — per-resource channel with retry and backoff
//! - [`reconcile`] / [`cache`] — change feed merged into per-collection caches
//! - [`presence`] — heartbeat roster with stale pruning
//! - [`cursor`] — frame-sampled, distance-filtered pointer sharing
//! - [`mutation`] — optimistic writes and the deletion undo window
//! - [`storage`] — durable pending deletions and cached identity (RocksDB)
//! - [`backend`] — command API trait and the in-memory backend
//! - [`client`] — the façade wiring all of the above

pub mod backend;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod model;
pub mod mutation;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use backend::{CommandApi, CommandError, CommandKind, MemoryBackend};
pub use cache::{CacheChange, CacheNotification, CacheWrite, CollectionSnapshot, LocalCache};
pub use client::BoardClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CorrelationRule, CursorConfig, MutationConfig, PresenceConfig, ReconcileConfig,
    ReconnectConfig, SyncConfig,
};
pub use connection::{
    ChannelPort, ConnectionError, ConnectionHandle, ConnectionManager, ConnectionState,
    ConnectionStatus,
};
pub use cursor::{
    ContainerBounds, CursorBroadcaster, CursorColor, CursorEntry, CursorMessage, CursorThrottle,
    CursorTracker, Vec2,
};
pub use model::{
    ChangeEvent, ChangeKind, Collection, EntityId, FieldValue, Identity, PendingDeletion,
    ResourceId, Row, UserId,
};
pub use mutation::{
    Commit, DeletionOutcome, MutationEngine, MutationError, PendingCreate, UndoHandle,
};
pub use presence::{
    PresenceEntry, PresenceMessage, PresenceSession, PresenceState, PresenceTracker, Roster,
    RosterView,
};
pub use protocol::{ChannelMessage, ProtocolError};
pub use reconcile::{AppliedChange, ApplyOutcome, CollectionFeed, Reconciler};
pub use storage::{LocalStore, MemoryPendingStore, PendingDeletionStore, StoreConfig, StoreError};
pub use transport::{Channel, Transport, TransportError, WsTransport};
