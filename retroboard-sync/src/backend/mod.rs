//! Remote command API of the persistent data store.
//!
//! ```text
//! MutationEngine ──create/update/delete──► CommandApi ──► store
//! Reconciler     ──fetch_all─────────────►      │
//!                                                ▼ change events
//!                                           Transport channel
//! ```

pub mod memory;

pub use memory::MemoryBackend;

use std::future::Future;
use thiserror::Error;

use crate::model::{Collection, EntityId, ResourceId, Row};

/// Which command a call was, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Create,
    Update,
    Delete,
    Fetch,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Create => "create",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
            CommandKind::Fetch => "fetch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("{0} does not exist")]
    NotFound(EntityId),
    #[error("server unavailable: {0}")]
    Unavailable(String),
}

/// Authoritative create/update/delete/fetch per resource and collection.
///
/// Writes return the row exactly as the server stored it.
pub trait CommandApi: Send + Sync + 'static {
    fn create(
        &self,
        resource: &ResourceId,
        collection: &Collection,
        row: Row,
    ) -> impl Future<Output = Result<Row, CommandError>> + Send;

    fn update(
        &self,
        resource: &ResourceId,
        collection: &Collection,
        id: &EntityId,
        patch: Row,
    ) -> impl Future<Output = Result<Row, CommandError>> + Send;

    fn delete(
        &self,
        resource: &ResourceId,
        collection: &Collection,
        id: &EntityId,
    ) -> impl Future<Output = Result<(), CommandError>> + Send;

    fn fetch_all(
        &self,
        resource: &ResourceId,
        collection: &Collection,
    ) -> impl Future<Output = Result<Vec<Row>, CommandError>> + Send;
}
