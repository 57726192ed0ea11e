//! Tunables for every component.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::model::Collection;

/// Retry/backoff policy for the subscription channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first automatic retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Bound on a single connect + handshake attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    /// Entries not refreshed for this long are pruned.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorConfig {
    pub frame_interval: Duration,
    /// Minimum movement, in percentage units, before a new position is sent.
    pub min_distance: f32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(16),
            min_distance: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationConfig {
    pub undo_window: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self { undo_window: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Fields that only prove liveness. Updates touching nothing else are dropped.
    pub heartbeat_fields: BTreeSet<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { heartbeat_fields: BTreeSet::from(["last_seen_at".to_string()]) }
    }
}

/// How a server row is matched to the optimistic row it confirms.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRule {
    /// Field echoing the temporary id back from the server.
    pub ref_field: String,
    /// Field stamped with the creation time (epoch ms).
    pub time_field: String,
    /// Fields that must be equal for the fallback match.
    pub content_fields: Vec<String>,
    /// Maximum `time_field` distance for the fallback match.
    pub window_ms: u64,
}

impl Default for CorrelationRule {
    fn default() -> Self {
        Self {
            ref_field: "client_ref".to_string(),
            time_field: "created_at".to_string(),
            content_fields: vec!["author_id".to_string(), "content".to_string()],
            window_ms: 10_000,
        }
    }
}

/// Everything a [`BoardClient`](crate::client::BoardClient) needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Buffer size of the channel and cache broadcast buses.
    pub channel_capacity: usize,
    pub reconnect: ReconnectConfig,
    pub presence: PresenceConfig,
    pub cursor: CursorConfig,
    pub mutation: MutationConfig,
    pub reconcile: ReconcileConfig,
    pub correlation: CorrelationRule,
    /// Collections loaded and kept live on open.
    pub collections: Vec<Collection>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            presence: PresenceConfig::default(),
            cursor: CursorConfig::default(),
            mutation: MutationConfig::default(),
            reconcile: ReconcileConfig::default(),
            correlation: CorrelationRule::default(),
            collections: vec![Collection::from("items")],
        }
    }
}

impl SyncConfig {
    /// Short timers for tests running on real time.
    pub fn for_testing() -> Self {
        Self {
            channel_capacity: 64,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2,
                connect_timeout: Duration::from_millis(200),
            },
            presence: PresenceConfig {
                heartbeat_interval: Duration::from_millis(50),
                stale_after: Duration::from_millis(150),
                sweep_interval: Duration::from_millis(25),
            },
            cursor: CursorConfig {
                frame_interval: Duration::from_millis(5),
                min_distance: 5.0,
            },
            mutation: MutationConfig { undo_window: Duration::from_millis(100) },
            ..Self::default()
        }
    }

    pub fn with_collections<I, C>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Collection>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }
}
