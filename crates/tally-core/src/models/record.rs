//! Generic synced record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Entity kinds that take part in sync.
///
/// The order of [`EntityKind::ALL`] is the order the orchestrator visits kinds
/// in, parents before children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Sale,
    SaleItem,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Product, Self::Sale, Self::SaleItem];

    /// Backing table name in both stores.
    pub const fn table(self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::Sale => "sales",
            Self::SaleItem => "sale_items",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Sale => "sale",
            Self::SaleItem => "sale_item",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.label() == s || kind.table() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity kind: {s}")))
    }
}

/// A unique record identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One revision of an entity as held by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    pub id: RecordId,
    /// Domain fields; opaque to the sync engine
    pub payload: Value,
    /// Last write timestamp (Unix ms)
    pub updated_at: i64,
    /// Tombstone timestamp (Unix ms)
    pub deleted_at: Option<i64>,
    /// Whether this revision has been accepted by the remote store.
    /// Always true for records read from the remote store.
    pub synced: bool,
}

impl Record {
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True when both records carry the same revision.
    pub fn same_revision(&self, other: &Self) -> bool {
        self.updated_at == other.updated_at
            && self.deleted_at == other.deleted_at
            && self.payload == other.payload
    }
}

/// Apply a JSON merge patch (RFC 7396) to `target`.
///
/// `null` values in the patch remove keys; nested objects merge recursively.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}
