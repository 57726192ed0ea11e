//! Ephemeral pointer sharing.
//!
//! ```text
//! update_cursor(px, py)
//!       │  ContainerBounds::to_percent
//!       ▼
//! CursorThrottle::sample      (latest sample wins)
//!       │  frame tick, distance > min_distance
//!       ▼
//! ChannelMessage::Cursor ──► peers ──► CursorTracker map ──► watch
//! ```
//!
//! Positions are percentages (0–100) of the tracked container, so peers with
//! different window sizes agree. `(-1, -1)` means "left the area". Nothing
//! here is ever persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CursorConfig;
use crate::connection::{ChannelPort, ConnectionStatus};
use crate::model::{Identity, UserId};
use crate::presence::PresenceMessage;
use crate::protocol::ChannelMessage;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Position in container percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    /// Sentinel for a pointer outside the tracked area.
    pub const OFFSCREEN: Vec2 = Vec2 { x: -1.0, y: -1.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_offscreen(&self) -> bool {
        self.x < 0.0 || self.y < 0.0
    }
}

/// RGBA cursor colour (0.0–1.0 per channel).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable colour for a user: hue from an FNV-1a hash of the id,
    /// high saturation, medium lightness.
    pub fn from_user_id(user_id: &UserId) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in user_id.as_str().bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let hue = (hash % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` for the UI layer.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.2, g: 0.5, b: 1.0, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Client-pixel rectangle of the element cursors are tracked over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerBounds {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl ContainerBounds {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self { left, top, width, height }
    }

    /// Convert client pixels to percentages; `None` outside the container
    /// or when it has no area.
    pub fn to_percent(&self, client_x: f32, client_y: f32) -> Option<Vec2> {
        if self.width <= 0.0 || self.height <= 0.0 {
            return None;
        }
        let x = (client_x - self.left) / self.width * 100.0;
        let y = (client_y - self.top) / self.height * 100.0;
        if (0.0..=100.0).contains(&x) && (0.0..=100.0).contains(&y) {
            Some(Vec2::new(x, y))
        } else {
            None
        }
    }
}

/// Wire payload of `ChannelMessage::Cursor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMessage {
    pub user_id: UserId,
    pub position: Vec2,
    pub color: CursorColor,
}

/// A remote cursor as seen by the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorEntry {
    pub user_id: UserId,
    pub x: f32,
    pub y: f32,
    pub color: CursorColor,
}

impl CursorEntry {
    pub fn is_offscreen(&self) -> bool {
        Vec2::new(self.x, self.y).is_offscreen()
    }
}

impl From<CursorMessage> for CursorEntry {
    fn from(msg: CursorMessage) -> Self {
        Self {
            user_id: msg.user_id,
            x: msg.position.x,
            y: msg.position.y,
            color: msg.color,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Sampling
// ───────────────────────────────────────────────────────────────────

/// Per-frame, distance-filtered sampler for the local pointer.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    pending: Option<Vec2>,
    last_sent: Option<Vec2>,
    min_distance: f32,
}

impl CursorThrottle {
    pub fn new(min_distance: f32) -> Self {
        Self { pending: None, last_sent: None, min_distance }
    }

    /// Record a sample; only the latest one per frame is kept.
    pub fn sample(&mut self, position: Vec2) {
        self.pending = Some(position);
    }

    /// Called once per frame. Returns the position to broadcast, if any.
    pub fn on_frame(&mut self) -> Option<Vec2> {
        let next = self.pending.take()?;
        let send = match self.last_sent {
            None => true,
            Some(last) if next.is_offscreen() => !last.is_offscreen(),
            Some(last) if last.is_offscreen() => true,
            Some(last) => last.distance(&next) > self.min_distance,
        };
        if send {
            self.last_sent = Some(next);
            Some(next)
        } else {
            None
        }
    }

    /// Forget what was sent, so the next position goes out unconditionally.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }

    pub fn last_sent(&self) -> Option<Vec2> {
        self.last_sent
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker task
// ───────────────────────────────────────────────────────────────────

enum CursorCommand {
    Move { x: f32, y: f32 },
    Leave,
    Resize(ContainerBounds),
}

/// Remote cursors keyed by user.
pub type CursorMap = BTreeMap<UserId, CursorEntry>;

/// Spawns [`CursorTracker`]s.
#[derive(Debug, Clone, Default)]
pub struct CursorBroadcaster {
    config: CursorConfig,
}

impl CursorBroadcaster {
    pub fn new(config: CursorConfig) -> Self {
        Self { config }
    }

    /// Start tracking cursors on a connection.
    pub fn track(
        &self,
        port: ChannelPort,
        identity: &Identity,
        container: ContainerBounds,
    ) -> CursorTracker {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(CursorMap::new());
        let color = CursorColor::from_user_id(&identity.user_id);
        let shown = Arc::new(AtomicBool::new(false));
        let task = CursorTask {
            port: port.clone(),
            user_id: identity.user_id.clone(),
            color,
            shown: shown.clone(),
            container,
            throttle: CursorThrottle::new(self.config.min_distance),
            frame_interval: self.config.frame_interval,
            cursors: CursorMap::new(),
            view: view_tx,
        };
        let handle = tokio::spawn(task.run(command_rx));
        CursorTracker {
            commands,
            view,
            task: handle,
            port,
            user_id: identity.user_id.clone(),
            color,
            shown,
        }
    }
}

/// Handle to a running cursor session. Dropping it stops the task and
/// moves a visible cursor off screen for peers.
pub struct CursorTracker {
    commands: mpsc::UnboundedSender<CursorCommand>,
    view: watch::Receiver<CursorMap>,
    task: JoinHandle<()>,
    port: ChannelPort,
    user_id: UserId,
    color: CursorColor,
    /// Whether peers currently see an on-screen cursor from us.
    shown: Arc<AtomicBool>,
}

impl CursorTracker {
    /// Current remote cursors, own cursor excluded.
    pub fn cursors(&self) -> Vec<CursorEntry> {
        self.view.borrow().values().cloned().collect()
    }

    pub fn watch(&self) -> watch::Receiver<CursorMap> {
        self.view.clone()
    }

    /// Feed a pointer position in client pixels.
    pub fn update_cursor(&self, client_x: f32, client_y: f32) {
        let _ = self.commands.send(CursorCommand::Move { x: client_x, y: client_y });
    }

    /// Pointer left the tracked element.
    pub fn pointer_left(&self) {
        let _ = self.commands.send(CursorCommand::Leave);
    }

    pub fn set_container(&self, bounds: ContainerBounds) {
        let _ = self.commands.send(CursorCommand::Resize(bounds));
    }
}

impl Drop for CursorTracker {
    fn drop(&mut self) {
        self.task.abort();
        if self.shown.swap(false, Ordering::SeqCst) {
            let _ = self.port.send(ChannelMessage::Cursor(CursorMessage {
                user_id: self.user_id.clone(),
                position: Vec2::OFFSCREEN,
                color: self.color,
            }));
        }
    }
}

struct CursorTask {
    port: ChannelPort,
    user_id: UserId,
    color: CursorColor,
    shown: Arc<AtomicBool>,
    container: ContainerBounds,
    throttle: CursorThrottle,
    frame_interval: Duration,
    cursors: CursorMap,
    view: watch::Sender<CursorMap>,
}

impl CursorTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CursorCommand>) {
        let mut feed = self.port.subscribe();
        let mut state = self.port.watch_state();
        let mut frame = tokio::time::interval(self.frame_interval);
        frame.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CursorCommand::Move { x, y }) => {
                        let position = self.container.to_percent(x, y).unwrap_or(Vec2::OFFSCREEN);
                        self.throttle.sample(position);
                    }
                    Some(CursorCommand::Leave) => self.throttle.sample(Vec2::OFFSCREEN),
                    Some(CursorCommand::Resize(bounds)) => self.container = bounds,
                    None => break,
                },
                _ = frame.tick() => self.flush(),
                incoming = feed.recv() => match incoming {
                    Ok(msg) => self.handle_incoming(msg),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("Cursor feed lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = state.borrow_and_update().status == ConnectionStatus::Connected;
                    if !connected {
                        self.cursors.clear();
                        self.throttle.reset();
                        self.shown.store(false, Ordering::SeqCst);
                        self.publish();
                    }
                }
            }
        }
    }

    fn flush(&mut self) {
        let Some(position) = self.throttle.on_frame() else {
            return;
        };
        let msg = ChannelMessage::Cursor(CursorMessage {
            user_id: self.user_id.clone(),
            position,
            color: self.color,
        });
        match self.port.send(msg) {
            Ok(()) => self.shown.store(!position.is_offscreen(), Ordering::SeqCst),
            Err(e) => {
                log::trace!("Cursor update dropped: {e}");
                self.throttle.reset();
            }
        }
    }

    fn handle_incoming(&mut self, msg: ChannelMessage) {
        match msg {
            ChannelMessage::Cursor(cursor) if cursor.user_id != self.user_id => {
                self.cursors.insert(cursor.user_id.clone(), cursor.into());
                self.publish();
            }
            ChannelMessage::Presence(PresenceMessage::Leave { user_id }) => {
                if self.cursors.remove(&user_id).is_some() {
                    self.publish();
                }
            }
            _ => {}
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.cursors.clone());
    }
}
