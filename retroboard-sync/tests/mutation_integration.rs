//! Integration tests for optimistic writes and the deletion undo window.
//!
//! The engine runs against the in-memory backend; timers run on paused
//! tokio time so deadlines are exact.

use retroboard_sync::backend::{CommandApi, CommandError, CommandKind, MemoryBackend};
use retroboard_sync::cache::LocalCache;
use retroboard_sync::clock::ManualClock;
use retroboard_sync::config::{CorrelationRule, MutationConfig, ReconcileConfig};
use retroboard_sync::model::{ChangeEvent, Collection, EntityId, ResourceId, Row};
use retroboard_sync::mutation::{DeletionOutcome, MutationEngine, MutationError};
use retroboard_sync::reconcile::Reconciler;
use retroboard_sync::storage::{LocalStore, MemoryPendingStore, PendingDeletionStore, StoreConfig};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

fn board() -> ResourceId {
    ResourceId::from("retro-1")
}

fn items() -> Collection {
    Collection::from("items")
}

fn item(id: &str, content: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("content", content)
        .with("author_id", "alice")
        .with("column", "went_well")
}

struct Fixture {
    backend: Arc<MemoryBackend>,
    cache: LocalCache,
    store: Arc<MemoryPendingStore>,
    clock: Arc<ManualClock>,
    engine: MutationEngine<MemoryBackend>,
}

fn fixture(backend: MemoryBackend, now_ms: u64) -> Fixture {
    let backend = Arc::new(backend);
    let cache = LocalCache::new(64);
    let store = Arc::new(MemoryPendingStore::new());
    let clock = Arc::new(ManualClock::new(now_ms));
    let engine = MutationEngine::new(
        board(),
        "alice".into(),
        cache.clone(),
        backend.clone(),
        store.clone(),
        clock.clone(),
        MutationConfig::default(),
        CorrelationRule::default(),
    );
    Fixture { backend, cache, store, clock, engine }
}

/// A fixture with `srv-42` present both on the server and in the cache.
fn seeded(now_ms: u64) -> Fixture {
    let fx = fixture(MemoryBackend::new(), now_ms);
    let row = item("srv-42", "standups are short");
    fx.backend.seed(&board(), &items(), vec![row.clone()]);
    fx.cache.upsert(&items(), row);
    fx
}

// ─── Create ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_confirms_into_single_server_row() {
    let fx = fixture(MemoryBackend::new().with_id_start(42), 1000);

    let pending = fx.engine.create(&items(), Row::new().with("content", "pairing helped"));
    assert_eq!(pending.temp_id, EntityId::from("temp-1000"));

    // Visible before the server answers.
    let optimistic = fx.cache.get(&items(), &pending.temp_id).unwrap();
    assert_eq!(optimistic.get("author_id").and_then(|v| v.as_str()), Some("alice"));
    assert_eq!(optimistic.get("client_ref").and_then(|v| v.as_str()), Some("temp-1000"));

    let confirmed = pending.commit.await.unwrap();
    assert_eq!(confirmed.id(), Some(EntityId::from("srv-42")));

    let snapshot = fx.cache.snapshot(&items());
    assert_eq!(snapshot.rows.len(), 1);
    assert!(snapshot.find(&"srv-42".into()).is_some());
    assert!(fx.cache.temporary_rows(&items()).is_empty());
}

#[tokio::test]
async fn test_temp_ids_unique_within_same_millisecond() {
    let fx = fixture(MemoryBackend::new(), 1000);
    let a = fx.engine.create(&items(), Row::new().with("content", "a"));
    let b = fx.engine.create(&items(), Row::new().with("content", "b"));
    assert_ne!(a.temp_id, b.temp_id);
    assert_eq!(fx.cache.temporary_rows(&items()).len(), 2);
    a.commit.await.unwrap();
    b.commit.await.unwrap();
    assert_eq!(fx.cache.len(&items()), 2);
}

#[tokio::test]
async fn test_temp_ids_not_reused_when_clock_steps_back() {
    let fx = fixture(MemoryBackend::new(), 1000);
    let first = fx.engine.create(&items(), Row::new().with("content", "a"));
    fx.clock.set(900);
    let second = fx.engine.create(&items(), Row::new().with("content", "b"));
    fx.clock.set(1000);
    let third = fx.engine.create(&items(), Row::new().with("content", "c"));

    assert_eq!(first.temp_id, EntityId::from("temp-1000"));
    assert_ne!(second.temp_id, first.temp_id);
    assert_ne!(third.temp_id, first.temp_id);
    assert_ne!(third.temp_id, second.temp_id);
    assert_eq!(fx.cache.temporary_rows(&items()).len(), 3);
}

#[tokio::test]
async fn test_failed_create_drops_temp_row() {
    let fx = fixture(MemoryBackend::new(), 1000);
    fx.backend.fail_next(CommandKind::Create, CommandError::Rejected("board is locked".into()));

    let pending = fx.engine.create(&items(), Row::new().with("content", "too late"));
    assert!(fx.cache.contains(&items(), &pending.temp_id));

    let err = pending.commit.await.unwrap_err();
    assert_eq!(err.to_string(), "Could not create the item: rejected by server: board is locked");
    assert_eq!(fx.cache.len(&items()), 0);
}

// ─── Update ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_applies_before_server_confirms() {
    let fx = seeded(0);
    fx.backend.set_latency(Duration::from_millis(50));

    let commit = fx.engine.update(&items(), &"srv-42".into(), Row::new().with("content", "edited"));
    let local = fx.cache.get(&items(), &"srv-42".into()).unwrap();
    assert_eq!(local.get("content").and_then(|v| v.as_str()), Some("edited"));

    let server = commit.await.unwrap();
    assert_eq!(server.get("content").and_then(|v| v.as_str()), Some("edited"));
    assert_eq!(fx.cache.get(&items(), &"srv-42".into()), Some(server));
}

#[tokio::test]
async fn test_failed_update_restores_exact_snapshot() {
    let fx = seeded(0);
    let config = bincode::config::standard();
    let before = fx.cache.get(&items(), &"srv-42".into()).unwrap();
    let before_bytes = bincode::serde::encode_to_vec(&before, config).unwrap();

    fx.backend.fail_next(CommandKind::Update, CommandError::Unavailable("timeout".into()));
    let patch = Row::new().with("content", "rewritten").with("votes", 3i64);
    let err = fx.engine.update(&items(), &"srv-42".into(), patch).await.unwrap_err();
    assert!(matches!(err, MutationError::Command { op: "update", .. }));

    let after = fx.cache.get(&items(), &"srv-42".into()).unwrap();
    let after_bytes = bincode::serde::encode_to_vec(&after, config).unwrap();
    assert_eq!(before_bytes, after_bytes);
}

#[tokio::test]
async fn test_update_rejects_unknown_and_temporary_ids() {
    let fx = fixture(MemoryBackend::new(), 0);
    let err = fx.engine.update(&items(), &"srv-9".into(), Row::new()).await.unwrap_err();
    assert_eq!(err, MutationError::NotFound("srv-9".into()));

    let err = fx.engine.update(&items(), &"temp-5".into(), Row::new()).await.unwrap_err();
    assert_eq!(err, MutationError::Unconfirmed("temp-5".into()));
    assert_eq!(fx.backend.command_count(CommandKind::Update), 0);
}

// ─── Delete with undo ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_undo_restores_row_without_remote_delete() {
    let fx = seeded(0);
    let original = fx.cache.get(&items(), &"srv-42".into()).unwrap();

    let handle = fx.engine.remove(&items(), &"srv-42".into(), None).unwrap();
    assert!(!fx.cache.contains(&items(), &"srv-42".into()));
    assert_eq!(fx.store.get(&"srv-42".into()).unwrap().scheduled_at, 5000);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    fx.clock.set(2000);
    assert!(handle.undo());
    assert!(!handle.undo());

    assert_eq!(fx.cache.get(&items(), &"srv-42".into()), Some(original));
    assert!(fx.store.is_empty());
    assert_eq!(handle.settled().await, DeletionOutcome::Undone);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 0);
    assert!(fx.backend.row(&board(), &items(), &"srv-42".into()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_delete_fires_once_at_deadline() {
    let fx = seeded(0);
    let start = Instant::now();
    let handle = fx.engine.remove(&items(), &"srv-42".into(), Some("col-1".into())).unwrap();
    assert_eq!(handle.record().parent_id, Some(EntityId::from("col-1")));

    tokio::time::sleep(Duration::from_millis(4999)).await;
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 0);
    assert!(handle.is_pending());

    assert_eq!(handle.settled().await, DeletionOutcome::Committed);
    assert!(start.elapsed() >= Duration::from_millis(5000));
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 1);
    assert!(fx.store.is_empty());
    assert!(!handle.undo());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 1);
    assert!(fx.backend.row(&board(), &items(), &"srv-42".into()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_undo_commits_immediately() {
    let fx = seeded(0);
    let start = Instant::now();
    let handle = fx.engine.remove(&items(), &"srv-42".into(), None).unwrap();

    assert!(handle.cancel_undo());
    assert!(!handle.cancel_undo());
    assert_eq!(handle.settled().await, DeletionOutcome::Committed);
    assert!(start.elapsed() < Duration::from_millis(5000));
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_delete_restores_row() {
    let fx = seeded(0);
    fx.backend.fail_next(CommandKind::Delete, CommandError::Unavailable("503".into()));

    let handle = fx.engine.remove(&items(), &"srv-42".into(), None).unwrap();
    let err = match handle.settled().await {
        DeletionOutcome::Failed(err) => err,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(err.to_string(), "Could not delete the item: server unavailable: 503");

    assert!(fx.cache.contains(&items(), &"srv-42".into()));
    assert!(fx.store.is_empty());

    // Not re-armed.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_row_already_gone_counts_as_committed() {
    let fx = fixture(MemoryBackend::new(), 0);
    fx.cache.upsert(&items(), item("srv-7", "removed elsewhere"));

    let handle = fx.engine.remove(&items(), &"srv-7".into(), None).unwrap();
    assert_eq!(handle.settled().await, DeletionOutcome::Committed);
    assert!(!fx.cache.contains(&items(), &"srv-7".into()));
    assert!(fx.store.is_empty());
}

/// A reconciler over the fixture's cache, standing in for the change feed.
fn feed(fx: &Fixture) -> Reconciler {
    let reconciler = Reconciler::new(fx.cache.clone(), ReconcileConfig::default(), CorrelationRule::default());
    reconciler.track(items(), |_| true);
    reconciler
}

#[tokio::test(start_paused = true)]
async fn test_undo_after_delete_elsewhere_keeps_row_gone() {
    let fx = seeded(0);
    let feed = feed(&fx);
    let handle = fx.engine.remove(&items(), &"srv-42".into(), None).unwrap();

    // Another client deletes the same row during our undo window.
    fx.backend.delete(&board(), &items(), &"srv-42".into()).await.unwrap();
    feed.apply(&ChangeEvent::delete(items(), item("srv-42", "standups are short")));

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(!handle.undo());
    assert_eq!(handle.settled().await, DeletionOutcome::Committed);
    assert!(!fx.cache.contains(&items(), &"srv-42".into()));
    assert!(!fx.cache.is_suppressed(&items(), &"srv-42".into()));
    assert!(fx.store.is_empty());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_after_delete_elsewhere_skips_remote_delete() {
    let fx = seeded(0);
    let feed = feed(&fx);
    let handle = fx.engine.remove(&items(), &"srv-42".into(), None).unwrap();

    feed.apply(&ChangeEvent::delete(items(), item("srv-42", "standups are short")));

    assert_eq!(handle.settled().await, DeletionOutcome::Committed);
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 0);
    assert!(!fx.cache.contains(&items(), &"srv-42".into()));
    assert!(fx.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_does_not_block_deletion() {
    let fx = seeded(0);
    fx.store.set_fail_writes(true);

    let handle = fx.engine.remove(&items(), &"srv-42".into(), None).unwrap();
    assert!(fx.store.is_empty());
    assert_eq!(handle.settled().await, DeletionOutcome::Committed);
    assert_eq!(fx.backend.command_count(CommandKind::Delete), 1);
}

#[tokio::test]
async fn test_remove_rejects_unknown_and_temporary_ids() {
    let fx = fixture(MemoryBackend::new(), 0);
    assert_eq!(
        fx.engine.remove(&items(), &"srv-1".into(), None).err(),
        Some(MutationError::NotFound("srv-1".into()))
    );
    assert_eq!(
        fx.engine.remove(&items(), &"temp-3".into(), None).err(),
        Some(MutationError::Unconfirmed("temp-3".into()))
    );
}

// ─── Reload survival ─────────────────────────────────────────────

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

/// Runs one "session": removes `srv-42` at t=0, then the runtime (and every
/// task in it) goes away as if the page were closed.
fn delete_then_close(store: Arc<dyn PendingDeletionStore>, backend: Arc<MemoryBackend>) {
    let rt = paused_runtime();
    rt.block_on(async {
        let cache = LocalCache::new(16);
        cache.upsert(&items(), item("srv-42", "standups are short"));
        let engine = MutationEngine::new(
            board(),
            "alice".into(),
            cache,
            backend,
            store,
            Arc::new(ManualClock::new(0)),
            MutationConfig::default(),
            CorrelationRule::default(),
        );
        let _handle = engine.remove(&items(), &"srv-42".into(), None).unwrap();
    });
    drop(rt);
}

fn reopen(
    store: Arc<dyn PendingDeletionStore>,
    backend: Arc<MemoryBackend>,
    now_ms: u64,
) -> (LocalCache, MutationEngine<MemoryBackend>) {
    let cache = LocalCache::new(16);
    cache.upsert(&items(), item("srv-42", "standups are short"));
    let engine = MutationEngine::new(
        board(),
        "alice".into(),
        cache.clone(),
        backend,
        store,
        Arc::new(ManualClock::new(now_ms)),
        MutationConfig::default(),
        CorrelationRule::default(),
    );
    (cache, engine)
}

#[test]
fn test_pending_deletion_reoffered_after_reload() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(&board(), &items(), vec![item("srv-42", "standups are short")]);

    delete_then_close(store.clone(), backend.clone());
    assert_eq!(store.pending_count().unwrap(), 1);
    assert_eq!(backend.command_count(CommandKind::Delete), 0);

    paused_runtime().block_on(async {
        let (cache, engine) = reopen(store.clone(), backend.clone(), 2000);
        let handles = engine.resume_pending();
        assert_eq!(handles.len(), 1);
        assert!(!cache.contains(&items(), &"srv-42".into()));

        // 3s of the window remain.
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(handles[0].is_pending());
        assert!(handles[0].undo());
        assert!(start.elapsed() < Duration::from_millis(3000));
        assert!(cache.contains(&items(), &"srv-42".into()));
    });

    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(backend.command_count(CommandKind::Delete), 0);
}

#[test]
fn test_expired_deletion_commits_silently_after_reload() {
    let store = Arc::new(MemoryPendingStore::new());
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(&board(), &items(), vec![item("srv-42", "standups are short")]);

    delete_then_close(store.clone(), backend.clone());
    assert_eq!(store.len(), 1);

    paused_runtime().block_on(async {
        let (cache, engine) = reopen(store.clone(), backend.clone(), 6000);
        assert!(engine.resume_pending().is_empty());
        assert!(!cache.contains(&items(), &"srv-42".into()));
        assert!(store.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.command_count(CommandKind::Delete), 1);
        assert!(backend.row(&board(), &items(), &"srv-42".into()).is_none());
    });
}

#[test]
fn test_resume_ignores_other_resources() {
    let store = Arc::new(MemoryPendingStore::new());
    let backend = Arc::new(MemoryBackend::new());
    delete_then_close(store.clone(), backend.clone());

    paused_runtime().block_on(async {
        let engine = MutationEngine::new(
            ResourceId::from("retro-2"),
            "alice".into(),
            LocalCache::new(16),
            backend.clone(),
            store.clone(),
            Arc::new(ManualClock::new(1000)),
            MutationConfig::default(),
            CorrelationRule::default(),
        );
        assert!(engine.resume_pending().is_empty());
    });
    assert_eq!(store.len(), 1);
}
