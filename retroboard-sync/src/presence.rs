//! Who is looking at a board right now.
//!
//! ```text
//! join ──► Announce ──► peers stamp last_seen_at with their own clock
//!   │
//!   ├─ every heartbeat_interval: Announce again
//!   ├─ every sweep_interval:     prune entries older than stale_after
//!   ├─ peer Leave:               drop immediately
//!   └─ back to Connected:        Announce again
//! ```
//!
//! Presence traffic is best-effort. Missing announces are healed by the next
//! heartbeat, and a peer that vanishes without `Leave` ages out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::config::PresenceConfig;
use crate::connection::{ChannelPort, ConnectionStatus};
use crate::model::{Identity, UserId};
use crate::protocol::ChannelMessage;

/// Free-form per-user state (e.g. `status = "voting"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    fields: BTreeMap<String, String>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Wire payload of `ChannelMessage::Presence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// Join or heartbeat.
    Announce {
        user_id: UserId,
        display_name: String,
        state: PresenceState,
    },
    Leave { user_id: UserId },
}

impl PresenceMessage {
    pub fn user_id(&self) -> &UserId {
        match self {
            PresenceMessage::Announce { user_id, .. } | PresenceMessage::Leave { user_id } => user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    /// Receiver-side epoch ms of the last announce.
    pub last_seen_at: u64,
    pub state: PresenceState,
}

/// Effect of one presence message on the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Joined,
    Refreshed,
    Left,
    Ignored,
}

/// Pure roster bookkeeping; the session task drives it.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: BTreeMap<UserId, PresenceEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, msg: &PresenceMessage, now_ms: u64) -> RosterChange {
        match msg {
            PresenceMessage::Announce { user_id, display_name, state } => {
                let entry = PresenceEntry {
                    user_id: user_id.clone(),
                    display_name: display_name.clone(),
                    last_seen_at: now_ms,
                    state: state.clone(),
                };
                match self.entries.insert(user_id.clone(), entry) {
                    Some(_) => RosterChange::Refreshed,
                    None => RosterChange::Joined,
                }
            }
            PresenceMessage::Leave { user_id } => match self.entries.remove(user_id) {
                Some(_) => RosterChange::Left,
                None => RosterChange::Ignored,
            },
        }
    }

    /// Drop entries not refreshed within `stale_after_ms`, except `keep`.
    pub fn prune(&mut self, now_ms: u64, stale_after_ms: u64, keep: &UserId) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .entries
            .values()
            .filter(|e| &e.user_id != keep && now_ms.saturating_sub(e.last_seen_at) > stale_after_ms)
            .map(|e| e.user_id.clone())
            .collect();
        for user_id in &stale {
            self.entries.remove(user_id);
        }
        stale
    }

    pub fn remove(&mut self, user_id: &UserId) -> bool {
        self.entries.remove(user_id).is_some()
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn view(&self, local: &UserId) -> RosterView {
        let entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        let other_users = entries.iter().filter(|e| &e.user_id != local).cloned().collect();
        RosterView {
            active_users_count: entries.len(),
            entries,
            other_users,
        }
    }
}

/// Snapshot handed to the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterView {
    pub entries: Vec<PresenceEntry>,
    pub other_users: Vec<PresenceEntry>,
    pub active_users_count: usize,
}

impl RosterView {
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.iter().any(|e| &e.user_id == user_id)
    }
}

enum PresenceCommand {
    UpdateSelf(PresenceState),
    Leave,
}

/// Starts presence sessions.
#[derive(Clone)]
pub struct PresenceTracker {
    config: PresenceConfig,
    clock: Arc<dyn Clock>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Join a resource's presence roster through `port`.
    pub fn join(&self, port: ChannelPort, identity: &Identity) -> PresenceSession {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(RosterView::default());
        let task = SessionTask {
            port: port.clone(),
            identity: identity.clone(),
            state: PresenceState::default(),
            roster: Roster::new(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            view: view_tx,
        };
        let handle = tokio::spawn(task.run(command_rx));
        PresenceSession {
            commands,
            view,
            task: Some(handle),
            port,
            user_id: identity.user_id.clone(),
        }
    }
}

/// A live membership in a roster. Dropping it leaves.
pub struct PresenceSession {
    commands: mpsc::UnboundedSender<PresenceCommand>,
    view: watch::Receiver<RosterView>,
    task: Option<JoinHandle<()>>,
    port: ChannelPort,
    user_id: UserId,
}

impl PresenceSession {
    pub fn roster(&self) -> RosterView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RosterView> {
        self.view.clone()
    }

    pub fn update_self(&self, state: PresenceState) {
        let _ = self.commands.send(PresenceCommand::UpdateSelf(state));
    }

    /// Announce departure and stop heartbeating.
    pub async fn leave(mut self) {
        let _ = self.commands.send(PresenceCommand::Leave);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = self.port.send(ChannelMessage::Presence(PresenceMessage::Leave {
                user_id: self.user_id.clone(),
            }));
        }
    }
}

struct SessionTask {
    port: ChannelPort,
    identity: Identity,
    state: PresenceState,
    roster: Roster,
    config: PresenceConfig,
    clock: Arc<dyn Clock>,
    view: watch::Sender<RosterView>,
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PresenceCommand>) {
        let mut feed = self.port.subscribe();
        let mut conn = self.port.watch_state();
        let start = Instant::now();
        let mut heartbeat = interval_at(start + self.config.heartbeat_interval, self.config.heartbeat_interval);
        let mut sweep = interval_at(start + self.config.sweep_interval, self.config.sweep_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stale_after_ms = self.config.stale_after.as_millis() as u64;

        self.touch_self();
        self.announce();
        self.publish();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.touch_self();
                    self.announce();
                    self.publish();
                }
                _ = sweep.tick() => {
                    let now = self.clock.now_ms();
                    let removed = self.roster.prune(now, stale_after_ms, &self.identity.user_id);
                    if !removed.is_empty() {
                        log::debug!("Pruned {} stale presence entries", removed.len());
                        self.publish();
                    }
                }
                incoming = feed.recv() => match incoming {
                    Ok(ChannelMessage::Presence(msg)) => self.handle_remote(&msg),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Presence feed lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                command = commands.recv() => match command {
                    Some(PresenceCommand::UpdateSelf(state)) => {
                        self.state = state;
                        self.touch_self();
                        self.announce();
                        self.publish();
                    }
                    Some(PresenceCommand::Leave) | None => {
                        self.send(PresenceMessage::Leave { user_id: self.identity.user_id.clone() });
                        self.roster.remove(&self.identity.user_id);
                        self.publish();
                        break;
                    }
                },
                changed = conn.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if conn.borrow_and_update().status == ConnectionStatus::Connected {
                        self.announce();
                    }
                }
            }
        }
    }

    fn handle_remote(&mut self, msg: &PresenceMessage) {
        if msg.user_id() == &self.identity.user_id {
            return;
        }
        match self.roster.apply(msg, self.clock.now_ms()) {
            RosterChange::Joined => {
                log::debug!("Presence: {} joined", msg.user_id());
                // Let the newcomer learn about us without waiting for a heartbeat.
                self.announce();
                self.publish();
            }
            RosterChange::Refreshed | RosterChange::Left => self.publish(),
            RosterChange::Ignored => {}
        }
    }

    fn touch_self(&mut self) {
        let announce = self.announce_message();
        self.roster.apply(&announce, self.clock.now_ms());
    }

    fn announce_message(&self) -> PresenceMessage {
        PresenceMessage::Announce {
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
            state: self.state.clone(),
        }
    }

    fn announce(&self) {
        self.send(self.announce_message());
    }

    fn send(&self, msg: PresenceMessage) {
        if let Err(e) = self.port.send(ChannelMessage::Presence(msg)) {
            log::trace!("Presence message dropped: {e}");
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.roster.view(&self.identity.user_id));
    }
}
