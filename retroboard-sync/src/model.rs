//! Shared data model: identifiers, rows, change events and durable records.
//!
//! Rows are schemaless ordered maps so every board collection (items, votes,
//! stories, participants) flows through the same cache and reconciliation code.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Field holding the entity id inside a [`Row`].
pub const ID_FIELD: &str = "id";

/// Prefix of locally minted ids for rows the server has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Board or estimation session id.
    ResourceId
);
string_id!(
    /// Server-issued (or temporary) id of a collection row.
    EntityId
);
string_id!(
    /// Stable user id handed over by the identity provider.
    UserId
);
string_id!(
    /// Name of a backend collection (`items`, `votes`, `stories`, ...).
    Collection
);

impl EntityId {
    /// Build a temporary id for an optimistic row.
    ///
    /// `seq` disambiguates ids minted within the same millisecond.
    pub fn temporary(timestamp_ms: u64, seq: u32) -> Self {
        if seq == 0 {
            Self(format!("{TEMP_ID_PREFIX}{timestamp_ms}"))
        } else {
            Self(format!("{TEMP_ID_PREFIX}{timestamp_ms}-{seq}"))
        }
    }

    /// Whether this id was minted locally and still awaits server confirmation.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// A schemaless row, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    pub fn id(&self) -> Option<EntityId> {
        self.get(ID_FIELD)
            .and_then(FieldValue::as_str)
            .map(EntityId::from)
    }

    pub fn set_id(&mut self, id: &EntityId) {
        self.set(ID_FIELD, id.as_str());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Apply a patch: every field of `patch` overwrites ours. The id is never patched.
    pub fn merged(&self, patch: &Row) -> Row {
        let mut out = self.clone();
        for (field, value) in &patch.fields {
            if field == ID_FIELD {
                continue;
            }
            out.fields.insert(field.clone(), value.clone());
        }
        out
    }

    /// Names of fields whose values differ between `self` and `other`,
    /// including fields present on only one side.
    pub fn changed_fields(&self, other: &Row) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (field, value) in &self.fields {
            if other.fields.get(field) != Some(value) {
                changed.insert(field.clone());
            }
        }
        for field in other.fields.keys() {
            if !self.fields.contains_key(field) {
                changed.insert(field.clone());
            }
        }
        changed
    }
}

/// Kind of backend change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One notification from the backend change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub row: Row,
    pub previous_row: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(collection: Collection, row: Row) -> Self {
        Self { kind: ChangeKind::Insert, collection, row, previous_row: None }
    }

    pub fn update(collection: Collection, row: Row, previous_row: Option<Row>) -> Self {
        Self { kind: ChangeKind::Update, collection, row, previous_row }
    }

    pub fn delete(collection: Collection, row: Row) -> Self {
        Self { kind: ChangeKind::Delete, collection, row, previous_row: None }
    }
}

/// Durable record of a deletion still inside its undo window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub entity_id: EntityId,
    pub resource_id: ResourceId,
    pub collection: Collection,
    pub parent_id: Option<EntityId>,
    /// Full row as it was before deletion, used for restoration.
    pub snapshot: Row,
    /// Wall-clock deadline (ms since epoch) at which the remote delete is due.
    pub scheduled_at: u64,
}

impl PendingDeletion {
    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.scheduled_at
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.scheduled_at.saturating_sub(now_ms)
    }
}

/// Who the local user is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), display_name: display_name.into() }
    }

    /// Fresh anonymous identity (`Guest-xxxx`), not yet cached anywhere.
    pub fn anonymous() -> Self {
        let id = uuid::Uuid::new_v4();
        let short = &id.simple().to_string()[..4];
        Self {
            user_id: UserId::new(id.to_string()),
            display_name: format!("Guest-{short}"),
        }
    }
}
