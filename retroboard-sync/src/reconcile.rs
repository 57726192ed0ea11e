//! Merges the backend change feed into the local cache.
//!
//! ```text
//! ChannelMessage::Change ──► Reconciler::apply
//!                               │ untracked collection?    → ignore
//!                               │ heartbeat-only update?   → ignore
//!                               │ insert/update in scope   → upsert (or replace temp row)
//!                               │ insert/update out of scope → remove
//!                               │ delete                   → remove
//!                               ▼
//!                      LocalCache + CollectionFeed subscribers
//! ```
//!
//! Every transition into `Connected`, and every lagged feed, triggers a full
//! re-fetch of the subscribed collections.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::backend::CommandApi;
use crate::cache::{CacheWrite, LocalCache};
use crate::config::{CorrelationRule, ReconcileConfig};
use crate::connection::ChannelPort;
use crate::model::{ChangeEvent, ChangeKind, Collection, EntityId, ResourceId, Row};
use crate::protocol::ChannelMessage;

/// A change the reconciler actually made, as seen by one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedChange {
    Upserted { collection: Collection, row: Row },
    /// A temporary row was swapped for its authoritative version.
    Replaced { collection: Collection, temp_id: EntityId, row: Row },
    Removed { collection: Collection, id: EntityId },
    /// The collection was re-fetched wholesale.
    Reloaded { collection: Collection },
}

impl AppliedChange {
    pub fn collection(&self) -> &Collection {
        match self {
            AppliedChange::Upserted { collection, .. }
            | AppliedChange::Replaced { collection, .. }
            | AppliedChange::Removed { collection, .. }
            | AppliedChange::Reloaded { collection } => collection,
        }
    }

    fn row(&self) -> Option<&Row> {
        match self {
            AppliedChange::Upserted { row, .. } | AppliedChange::Replaced { row, .. } => Some(row),
            _ => None,
        }
    }
}

/// What [`Reconciler::apply`] did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Untracked,
    HeartbeatFiltered,
    Inserted(EntityId),
    Updated(EntityId),
    Replaced { temp_id: EntityId, id: EntityId },
    Removed(EntityId),
    /// Upsert with identical content.
    Unchanged,
    /// Nothing to do: no id, hidden id, unknown delete, or out of scope and not cached.
    Skipped,
}

type Predicate = Box<dyn Fn(&Row) -> bool + Send + Sync>;

struct Subscription {
    collection: Collection,
    predicate: Predicate,
    sender: Option<mpsc::UnboundedSender<AppliedChange>>,
}

impl Subscription {
    fn wants(&self, change: &AppliedChange) -> bool {
        &self.collection == change.collection() && change.row().map_or(true, |row| (self.predicate)(row))
    }
}

/// Receiver side of [`Reconciler::subscribe`].
pub struct CollectionFeed {
    collection: Collection,
    receiver: mpsc::UnboundedReceiver<AppliedChange>,
}

impl CollectionFeed {
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub async fn recv(&mut self) -> Option<AppliedChange> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AppliedChange> {
        self.receiver.try_recv().ok()
    }
}

pub struct Reconciler {
    cache: LocalCache,
    config: ReconcileConfig,
    correlation: CorrelationRule,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Reconciler {
    pub fn new(cache: LocalCache, config: ReconcileConfig, correlation: CorrelationRule) -> Self {
        Self { cache, config, correlation, subscriptions: Mutex::new(Vec::new()) }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `collection`, keeping only rows accepted by `predicate`.
    pub fn subscribe<F>(&self, collection: Collection, predicate: F) -> CollectionFeed
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions().push(Subscription {
            collection: collection.clone(),
            predicate: Box::new(predicate),
            sender: Some(sender),
        });
        CollectionFeed { collection, receiver }
    }

    /// Like [`subscribe`](Self::subscribe), for callers that only read the cache.
    pub fn track<F>(&self, collection: Collection, predicate: F)
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.subscriptions().push(Subscription {
            collection,
            predicate: Box::new(predicate),
            sender: None,
        });
    }

    /// Subscribed collections, without duplicates.
    pub fn collections(&self) -> Vec<Collection> {
        let mut collections: Vec<Collection> =
            self.subscriptions().iter().map(|s| s.collection.clone()).collect();
        collections.sort();
        collections.dedup();
        collections
    }

    fn is_tracked(&self, collection: &Collection) -> bool {
        self.subscriptions().iter().any(|s| &s.collection == collection)
    }

    fn in_scope(&self, collection: &Collection, row: &Row) -> bool {
        self.subscriptions()
            .iter()
            .any(|s| &s.collection == collection && (s.predicate)(row))
    }

    fn is_heartbeat(&self, event: &ChangeEvent) -> bool {
        if event.kind != ChangeKind::Update {
            return false;
        }
        let Some(previous) = &event.previous_row else {
            return false;
        };
        let changed = event.row.changed_fields(previous);
        !changed.is_empty() && changed.iter().all(|f| self.config.heartbeat_fields.contains(f))
    }

    fn notify(&self, change: AppliedChange) {
        self.subscriptions().retain(|s| match &s.sender {
            Some(sender) if s.wants(&change) => sender.send(change.clone()).is_ok(),
            _ => true,
        });
    }

    /// Apply one change event to the cache.
    pub fn apply(&self, event: &ChangeEvent) -> ApplyOutcome {
        let collection = &event.collection;
        if !self.is_tracked(collection) {
            return ApplyOutcome::Untracked;
        }
        if self.is_heartbeat(event) {
            log::trace!("Dropping heartbeat update in {collection}");
            return ApplyOutcome::HeartbeatFiltered;
        }
        let Some(id) = event.row.id() else {
            log::debug!("Change in {collection} without id");
            return ApplyOutcome::Skipped;
        };

        if event.kind == ChangeKind::Delete && self.cache.mark_gone(collection, &id) {
            log::debug!("{id} was deleted elsewhere while its removal was pending");
            return ApplyOutcome::Skipped;
        }
        if event.kind == ChangeKind::Delete || !self.in_scope(collection, &event.row) {
            return match self.cache.remove(collection, &id) {
                Some(_) => {
                    self.notify(AppliedChange::Removed { collection: collection.clone(), id: id.clone() });
                    ApplyOutcome::Removed(id)
                }
                None => ApplyOutcome::Skipped,
            };
        }

        if self.cache.is_suppressed(collection, &id) {
            return ApplyOutcome::Skipped;
        }

        if !self.cache.contains(collection, &id) {
            let temp = self
                .cache
                .temporary_rows(collection)
                .into_iter()
                .find(|temp| self.correlation.correlates(temp, &event.row))
                .and_then(|temp| temp.id());
            if let Some(temp_id) = temp {
                if self.cache.replace(collection, &temp_id, event.row.clone()).is_effective() {
                    log::debug!("Confirmed {temp_id} as {id}");
                    self.notify(AppliedChange::Replaced {
                        collection: collection.clone(),
                        temp_id: temp_id.clone(),
                        row: event.row.clone(),
                    });
                    return ApplyOutcome::Replaced { temp_id, id };
                }
                return ApplyOutcome::Skipped;
            }
        }

        let outcome = match self.cache.upsert(collection, event.row.clone()) {
            CacheWrite::Inserted => ApplyOutcome::Inserted(id),
            CacheWrite::Updated => ApplyOutcome::Updated(id),
            CacheWrite::Unchanged => return ApplyOutcome::Unchanged,
            CacheWrite::Suppressed | CacheWrite::MissingId => return ApplyOutcome::Skipped,
        };
        self.notify(AppliedChange::Upserted { collection: collection.clone(), row: event.row.clone() });
        outcome
    }

    /// Re-fetch every subscribed collection.
    pub async fn resync<C: CommandApi>(&self, api: &C, resource: &ResourceId) {
        for collection in self.collections() {
            self.cache.begin_load(&collection);
            match api.fetch_all(resource, &collection).await {
                Ok(rows) => {
                    let rows: Vec<Row> = rows.into_iter().filter(|r| self.in_scope(&collection, r)).collect();
                    // Optimistic rows whose create landed while we were away.
                    for temp in self.cache.temporary_rows(&collection) {
                        if rows.iter().any(|r| self.correlation.correlates(&temp, r)) {
                            if let Some(temp_id) = temp.id() {
                                self.cache.remove(&collection, &temp_id);
                            }
                        }
                    }
                    log::debug!("Loaded {} rows for {collection}", rows.len());
                    self.cache.replace_all(&collection, rows);
                    self.notify(AppliedChange::Reloaded { collection });
                }
                Err(e) => {
                    log::warn!("Fetching {collection} failed: {e}");
                    self.cache.fail_load(&collection, e.to_string());
                }
            }
        }
    }

    /// Drive the reconciler from a connection until the channel goes away.
    ///
    /// The feed is subscribed before this returns, so no event is missed.
    pub fn spawn<C: CommandApi>(self: &Arc<Self>, port: ChannelPort, api: Arc<C>) -> JoinHandle<()> {
        let mut feed = port.subscribe();
        let mut state = port.watch_state();
        let this = self.clone();
        tokio::spawn(async move {
            let resource = port.resource().clone();
            if state.borrow_and_update().is_connected() {
                this.resync(api.as_ref(), &resource).await;
            }
            loop {
                tokio::select! {
                    msg = feed.recv() => match msg {
                        Ok(ChannelMessage::Change(event)) => {
                            this.apply(&event);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Change feed for {resource} lagged by {n}, resyncing");
                            this.resync(api.as_ref(), &resource).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = state.borrow_and_update().is_connected();
                        if connected {
                            this.resync(api.as_ref(), &resource).await;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Collection {
        Collection::from("items")
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(LocalCache::new(64), ReconcileConfig::default(), CorrelationRule::default())
    }

    fn item(id: &str, content: &str) -> Row {
        Row::new().with("id", id).with("content", content).with("board_id", "b1")
    }

    #[test]
    fn test_untracked_collection_is_ignored() {
        let rec = reconciler();
        let outcome = rec.apply(&ChangeEvent::insert(items(), item("a", "x")));
        assert_eq!(outcome, ApplyOutcome::Untracked);
        assert_eq!(rec.cache().len(&items()), 0);
    }

    #[test]
    fn test_insert_update_delete() {
        let rec = reconciler();
        let mut feed = rec.subscribe(items(), |_| true);

        assert_eq!(rec.apply(&ChangeEvent::insert(items(), item("a", "x"))), ApplyOutcome::Inserted("a".into()));
        assert_eq!(
            rec.apply(&ChangeEvent::update(items(), item("a", "y"), Some(item("a", "x")))),
            ApplyOutcome::Updated("a".into())
        );
        assert_eq!(rec.apply(&ChangeEvent::delete(items(), item("a", "y"))), ApplyOutcome::Removed("a".into()));
        assert_eq!(rec.apply(&ChangeEvent::delete(items(), item("a", "y"))), ApplyOutcome::Skipped);

        assert!(matches!(feed.try_recv(), Some(AppliedChange::Upserted { .. })));
        assert!(matches!(feed.try_recv(), Some(AppliedChange::Upserted { .. })));
        assert!(matches!(feed.try_recv(), Some(AppliedChange::Removed { .. })));
        assert!(feed.try_recv().is_none());
    }

    #[test]
    fn test_update_for_unknown_id_inserts() {
        let rec = reconciler();
        let _feed = rec.subscribe(items(), |_| true);
        let outcome = rec.apply(&ChangeEvent::update(items(), item("b", "x"), None));
        assert_eq!(outcome, ApplyOutcome::Inserted("b".into()));
    }

    #[test]
    fn test_heartbeat_update_is_silent() {
        let rec = reconciler();
        let participants = Collection::from("participants");
        let mut feed = rec.subscribe(participants.clone(), |_| true);
        let before = Row::new().with("id", "p1").with("name", "Ann").with("last_seen_at", 1i64);
        rec.apply(&ChangeEvent::insert(participants.clone(), before.clone()));
        feed.try_recv();
        let mut cache_events = rec.cache().subscribe();

        let after = before.clone().with("last_seen_at", 2i64);
        let outcome = rec.apply(&ChangeEvent::update(participants.clone(), after, Some(before.clone())));

        assert_eq!(outcome, ApplyOutcome::HeartbeatFiltered);
        assert_eq!(rec.cache().get(&participants, &"p1".into()), Some(before));
        assert!(feed.try_recv().is_none());
        assert!(cache_events.try_recv().is_err());
    }

    #[test]
    fn test_mixed_update_is_not_heartbeat() {
        let rec = reconciler();
        let participants = Collection::from("participants");
        let _feed = rec.subscribe(participants.clone(), |_| true);
        let before = Row::new().with("id", "p1").with("name", "Ann").with("last_seen_at", 1i64);
        let after = before.clone().with("last_seen_at", 2i64).with("name", "Anna");

        let outcome = rec.apply(&ChangeEvent::update(participants, after, Some(before)));
        assert_eq!(outcome, ApplyOutcome::Inserted("p1".into()));
    }

    #[test]
    fn test_idempotent_upsert() {
        let rec = reconciler();
        let mut feed = rec.subscribe(items(), |_| true);
        rec.apply(&ChangeEvent::insert(items(), item("a", "x")));
        feed.try_recv();

        assert_eq!(rec.apply(&ChangeEvent::insert(items(), item("a", "x"))), ApplyOutcome::Unchanged);
        assert!(feed.try_recv().is_none());
    }

    #[test]
    fn test_out_of_scope_row_is_removed() {
        let rec = reconciler();
        let _feed = rec.subscribe(items(), |row| row.get("board_id").and_then(|v| v.as_str()) == Some("b1"));
        rec.apply(&ChangeEvent::insert(items(), item("a", "x")));

        let moved = item("a", "x").with("board_id", "b2");
        assert_eq!(
            rec.apply(&ChangeEvent::update(items(), moved.clone(), Some(item("a", "x")))),
            ApplyOutcome::Removed("a".into())
        );
        assert_eq!(rec.apply(&ChangeEvent::insert(items(), moved)), ApplyOutcome::Skipped);
    }

    #[test]
    fn test_server_row_replaces_temp_row() {
        let rec = reconciler();
        let mut feed = rec.subscribe(items(), |_| true);
        let temp = item("temp-1000", "Ship it").with("client_ref", "temp-1000");
        rec.cache().upsert(&items(), temp);

        let server = item("srv-42", "Ship it").with("client_ref", "temp-1000");
        let outcome = rec.apply(&ChangeEvent::insert(items(), server));

        assert_eq!(outcome, ApplyOutcome::Replaced { temp_id: "temp-1000".into(), id: "srv-42".into() });
        let snapshot = rec.cache().snapshot(&items());
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows[0].id(), Some(EntityId::from("srv-42")));
        assert!(matches!(feed.try_recv(), Some(AppliedChange::Replaced { .. })));
    }

    #[test]
    fn test_same_temp_id_from_another_author_is_not_a_match() {
        let rec = reconciler();
        let _feed = rec.subscribe(items(), |_| true);
        let mine = item("temp-1000", "Ship it").with("client_ref", "temp-1000").with("author_id", "alice");
        rec.cache().upsert(&items(), mine);

        let theirs = item("srv-7", "Ship it").with("client_ref", "temp-1000").with("author_id", "bob");
        assert_eq!(rec.apply(&ChangeEvent::insert(items(), theirs)), ApplyOutcome::Inserted("srv-7".into()));
        assert!(rec.cache().contains(&items(), &"temp-1000".into()));
        assert_eq!(rec.cache().len(&items()), 2);
    }

    #[test]
    fn test_delete_of_hidden_id_marks_it_gone() {
        let rec = reconciler();
        let _feed = rec.subscribe(items(), |_| true);
        rec.cache().suppress(&items(), &"a".into());

        assert_eq!(rec.apply(&ChangeEvent::delete(items(), item("a", "x"))), ApplyOutcome::Skipped);
        assert!(rec.cache().is_gone(&items(), &"a".into()));
    }

    #[test]
    fn test_suppressed_id_not_rematerialized() {
        let rec = reconciler();
        let _feed = rec.subscribe(items(), |_| true);
        rec.cache().suppress(&items(), &"a".into());
        assert_eq!(rec.apply(&ChangeEvent::insert(items(), item("a", "x"))), ApplyOutcome::Skipped);
        assert!(!rec.cache().contains(&items(), &"a".into()));
    }

    #[test]
    fn test_tracked_collection_without_feed() {
        let rec = reconciler();
        rec.track(items(), |_| true);
        assert_eq!(rec.apply(&ChangeEvent::insert(items(), item("a", "x"))), ApplyOutcome::Inserted("a".into()));
        assert_eq!(rec.collections(), vec![items()]);
    }

    #[test]
    fn test_dropped_feed_unsubscribes() {
        let rec = reconciler();
        let feed = rec.subscribe(items(), |_| true);
        rec.apply(&ChangeEvent::insert(items(), item("a", "x")));
        drop(feed);
        rec.apply(&ChangeEvent::insert(items(), item("b", "x")));
        assert_eq!(rec.apply(&ChangeEvent::insert(items(), item("c", "x"))), ApplyOutcome::Untracked);
    }
}
