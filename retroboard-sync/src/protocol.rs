//! Wire protocol for the per-resource subscription channel.
//!
//! Every frame is one bincode-encoded [`ChannelMessage`]:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ variant │ payload (change event / presence / cursor)   │
//! │ varint  │ variable                                     │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Handshake: the client sends `Subscribe { resource }`; the channel counts as
//! connected once the backend answers `Ack`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cursor::CursorMessage;
use crate::model::{ChangeEvent, ResourceId};
use crate::presence::PresenceMessage;

/// Top-level channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Client → backend: start streaming changes for a resource.
    Subscribe { resource: ResourceId },
    /// Backend → client: subscription is live.
    Ack { resource: ResourceId },
    /// Persisted change notification (backend → client only).
    Change(ChangeEvent),
    /// Ephemeral presence traffic, relayed between peers.
    Presence(PresenceMessage),
    /// Ephemeral cursor traffic, relayed between peers.
    Cursor(CursorMessage),
    /// Transport keepalive
    Ping,
    Pong,
}

impl ChannelMessage {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::Subscribe { .. } => "subscribe",
            ChannelMessage::Ack { .. } => "ack",
            ChannelMessage::Change(_) => "change",
            ChannelMessage::Presence(_) => "presence",
            ChannelMessage::Cursor(_) => "cursor",
            ChannelMessage::Ping => "ping",
            ChannelMessage::Pong => "pong",
        }
    }

    /// Whether peers may relay this message to each other.
    ///
    /// Change events only ever originate from the backend.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ChannelMessage::Presence(_) | ChannelMessage::Cursor(_))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected message during handshake: {0}")]
    UnexpectedMessage(&'static str),
}
