//! Integration tests for the change feed reconciler.
//!
//! A reconciler is driven by a real connection to the in-memory backend;
//! writes by "other clients" go straight through the backend's command API.

use retroboard_sync::backend::{CommandApi, CommandError, CommandKind, MemoryBackend};
use retroboard_sync::cache::{CacheChange, LocalCache};
use retroboard_sync::config::{CorrelationRule, ReconcileConfig, SyncConfig};
use retroboard_sync::connection::{ConnectionHandle, ConnectionManager, ConnectionStatus};
use retroboard_sync::model::{ChangeEvent, Collection, EntityId, ResourceId, Row};
use retroboard_sync::protocol::ChannelMessage;
use retroboard_sync::reconcile::{AppliedChange, CollectionFeed, Reconciler};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

fn board() -> ResourceId {
    ResourceId::from("retro-1")
}

fn items() -> Collection {
    Collection::from("items")
}

fn item(id: &str, content: &str, column: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("content", content)
        .with("column", column)
        .with("last_seen_at", 0i64)
}

/// Poll `cond` every 10ms for up to two seconds.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Next change other than a wholesale reload.
async fn next_change(feed: &mut CollectionFeed) -> Option<AppliedChange> {
    loop {
        match feed.recv().await {
            Some(AppliedChange::Reloaded { .. }) => continue,
            other => return other,
        }
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    _manager: ConnectionManager<MemoryBackend>,
    handle: ConnectionHandle,
    reconciler: Arc<Reconciler>,
    task: JoinHandle<()>,
}

impl Harness {
    fn cache(&self) -> &LocalCache {
        self.reconciler.cache()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Open a connection and start a reconciler tracking every `items` row.
fn start(backend: MemoryBackend) -> Harness {
    start_with(backend, |reconciler| reconciler.track(items(), |_| true))
}

fn start_with(backend: MemoryBackend, setup: impl FnOnce(&Reconciler)) -> Harness {
    let backend = Arc::new(backend);
    let manager = ConnectionManager::new(backend.clone(), SyncConfig::for_testing().reconnect, 64);
    let handle = manager.open(&board());
    let reconciler = Arc::new(Reconciler::new(
        LocalCache::new(64),
        ReconcileConfig::default(),
        CorrelationRule::default(),
    ));
    setup(&reconciler);
    let task = reconciler.spawn(handle.port(), backend.clone());
    Harness { backend, _manager: manager, handle, reconciler, task }
}

#[tokio::test(start_paused = true)]
async fn test_initial_load_on_connect() {
    let backend = MemoryBackend::new();
    backend.seed(
        &board(),
        &items(),
        vec![item("srv-1", "retro notes", "went_well"), item("srv-2", "flaky CI", "to_improve")],
    );
    let h = start(backend);

    assert!(eventually(|| h.cache().len(&items()) == 2).await);
    let snapshot = h.cache().snapshot(&items());
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_none());
    assert_eq!(h.backend.command_count(CommandKind::Fetch), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_writes_reach_cache_and_feed() {
    let h = start(MemoryBackend::new().with_id_start(7));
    let mut feed = h.reconciler.subscribe(items(), |_| true);
    assert!(eventually(|| h.handle.state().status == ConnectionStatus::Connected).await);

    // Another client creates, edits and deletes a row.
    let created = h
        .backend
        .create(&board(), &items(), Row::new().with("content", "ship it").with("column", "went_well"))
        .await
        .unwrap();
    let id = created.id().unwrap();
    assert_eq!(id, EntityId::from("srv-7"));

    assert!(matches!(
        next_change(&mut feed).await,
        Some(AppliedChange::Upserted { row, .. }) if row.id() == Some(id.clone())
    ));
    assert!(h.cache().contains(&items(), &id));

    h.backend.update(&board(), &items(), &id, Row::new().with("content", "shipped")).await.unwrap();
    let Some(AppliedChange::Upserted { row, .. }) = next_change(&mut feed).await else {
        panic!("expected an upsert");
    };
    assert_eq!(row.get("content").and_then(|v| v.as_str()), Some("shipped"));

    h.backend.delete(&board(), &items(), &id).await.unwrap();
    assert_eq!(next_change(&mut feed).await, Some(AppliedChange::Removed { collection: items(), id: id.clone() }));
    assert!(!h.cache().contains(&items(), &id));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_updates_are_invisible() {
    let backend = MemoryBackend::new();
    backend.seed(&board(), &items(), vec![item("srv-1", "retro notes", "went_well")]);
    let h = start(backend);
    assert!(eventually(|| h.cache().len(&items()) == 1).await);

    let mut feed = h.reconciler.subscribe(items(), |_| true);
    let mut notifications = h.cache().subscribe();
    let version = h.cache().snapshot(&items()).version;

    let before = item("srv-1", "retro notes", "went_well");
    let beat = before.clone().with("last_seen_at", 99_000i64);
    h.backend.inject(&board(), ChannelMessage::Change(ChangeEvent::update(items(), beat, Some(before.clone()))));

    // A real edit right behind it proves the heartbeat was already consumed.
    let edit = before.clone().with("content", "retro notes (edited)");
    h.backend.inject(&board(), ChannelMessage::Change(ChangeEvent::update(items(), edit.clone(), Some(before))));

    assert_eq!(next_change(&mut feed).await, Some(AppliedChange::Upserted { collection: items(), row: edit.clone() }));
    let note = notifications.recv().await.unwrap();
    assert_eq!(note.change, CacheChange::Upserted("srv-1".into()));
    assert_eq!(note.version, version + 1);
    assert_eq!(h.cache().get(&items(), &"srv-1".into()), Some(edit));
}

#[tokio::test(start_paused = true)]
async fn test_row_leaving_scope_is_removed() {
    let backend = MemoryBackend::new();
    backend.seed(
        &board(),
        &items(),
        vec![item("srv-1", "a", "went_well"), item("srv-2", "b", "to_improve")],
    );
    let h = start_with(backend, |reconciler| {
        reconciler.track(items(), |row| {
            row.get("column").and_then(|v| v.as_str()) == Some("went_well")
        })
    });
    assert!(eventually(|| h.cache().contains(&items(), &"srv-1".into())).await);
    assert!(!h.cache().contains(&items(), &"srv-2".into()));

    h.backend
        .update(&board(), &items(), &"srv-1".into(), Row::new().with("column", "to_improve"))
        .await
        .unwrap();
    assert!(eventually(|| h.cache().len(&items()) == 0).await);
}

#[tokio::test(start_paused = true)]
async fn test_feed_confirms_optimistic_row() {
    let h = start(MemoryBackend::new());
    let mut feed = h.reconciler.subscribe(items(), |_| true);
    assert!(eventually(|| h.handle.state().is_connected()).await);

    let temp = Row::new()
        .with("id", "temp-1000")
        .with("client_ref", "temp-1000")
        .with("content", "from this tab");
    h.cache().upsert(&items(), temp);

    let server = Row::new()
        .with("id", "srv-3")
        .with("client_ref", "temp-1000")
        .with("content", "from this tab");
    h.backend.inject(&board(), ChannelMessage::Change(ChangeEvent::insert(items(), server.clone())));

    assert_eq!(
        next_change(&mut feed).await,
        Some(AppliedChange::Replaced { collection: items(), temp_id: "temp-1000".into(), row: server })
    );
    let snapshot = h.cache().snapshot(&items());
    assert_eq!(snapshot.rows.len(), 1);
    assert!(snapshot.find(&"srv-3".into()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_refetches_missed_changes() {
    let backend = MemoryBackend::new();
    backend.seed(&board(), &items(), vec![item("srv-1", "a", "went_well")]);
    let h = start(backend);
    assert!(eventually(|| h.cache().len(&items()) == 1).await);

    // Changes made while the connection is down never reach the feed.
    h.backend.set_offline(true);
    h.backend.drop_connections(&board());
    assert!(eventually(|| h.handle.state().status == ConnectionStatus::Connecting).await);
    h.backend.seed(&board(), &items(), vec![item("srv-2", "b", "went_well")]);

    h.backend.set_offline(false);
    assert!(eventually(|| h.cache().len(&items()) == 2).await);
    assert!(h.backend.command_count(CommandKind::Fetch) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_is_recorded() {
    let backend = MemoryBackend::new();
    backend.fail_next(CommandKind::Fetch, CommandError::Unavailable("database restarting".into()));
    let h = start(backend);

    assert!(eventually(|| h.cache().snapshot(&items()).error.is_some()).await);
    let snapshot = h.cache().snapshot(&items());
    assert!(!snapshot.loading);
    assert_eq!(snapshot.error.as_deref(), Some("server unavailable: database restarting"));

    // The next successful load clears it.
    h.reconciler.resync(h.backend.as_ref(), &board()).await;
    assert!(h.cache().snapshot(&items()).error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_untracked_collections_are_ignored() {
    let h = start(MemoryBackend::new());
    assert!(eventually(|| h.handle.state().is_connected()).await);
    let votes = Collection::from("votes");

    h.backend.create(&board(), &votes, Row::new().with("value", 3i64)).await.unwrap();
    h.backend.create(&board(), &items(), Row::new().with("content", "marker")).await.unwrap();

    assert!(eventually(|| h.cache().len(&items()) == 1).await);
    assert_eq!(h.cache().len(&votes), 0);
}
