//! Wall-clock time source.
//!
//! Durable records and presence timestamps need epoch milliseconds, while
//! timers run on tokio's clock. [`SystemClock`] anchors the wall clock once and
//! advances it with `tokio::time::Instant`, so paused-time tests and real
//! runs see a consistent timeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::time::Instant;

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock anchored at construction and advanced by the tokio clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_ms: u64,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self { anchor_ms, anchor: Instant::now() }
    }

    /// Anchor at an explicit epoch time (useful with paused tokio time).
    pub fn starting_at(anchor_ms: u64) -> Self {
        Self { anchor_ms, anchor: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self { now: AtomicU64::new(now_ms) }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
