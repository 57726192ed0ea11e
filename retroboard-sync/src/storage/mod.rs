//! Durable local storage.
//!
//! ```text
//! ┌────────────────┐  save / remove   ┌──────────────────────────────────┐
//! │ MutationEngine │ ───────────────► │ LocalStore (RocksDB)             │
//! │ (undo window)  │ ◄─────────────── │ CF "pending_deletions" bincode+LZ4│
//! └────────────────┘   load_all on    │ CF "identity"          bincode   │
//!                      startup        └──────────────────────────────────┘
//! ```
//!
//! A pending deletion is on disk for exactly as long as its undo window is
//! open, so "is this still pending" can be answered after a reload.

pub mod memory;
pub mod rocks;

pub use memory::MemoryPendingStore;
pub use rocks::{LocalStore, StoreConfig};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::model::{EntityId, PendingDeletion};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Where in-flight deletions are kept across restarts.
pub trait PendingDeletionStore: Send + Sync {
    /// Insert or overwrite the record for `record.entity_id`.
    fn save(&self, record: &PendingDeletion) -> Result<(), StoreError>;

    /// Remove a record. Missing records are not an error.
    fn remove(&self, entity_id: &EntityId) -> Result<(), StoreError>;

    fn load_all(&self) -> Result<Vec<PendingDeletion>, StoreError>;
}

/// bincode, then LZ4 with the uncompressed size prepended.
pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
