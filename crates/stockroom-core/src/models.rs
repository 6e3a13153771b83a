//! Data models for Stockroom
//!
//! Defines the catalog entity, its identifier, and the confirmed/provisional
//! projection that every read path hands back to the host application.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Identifier of a catalog entity
///
/// Server-assigned ids arrive as JSON numbers or strings and are normalized
/// to strings. Ids for entities created offline are negative integers
/// (`-1`, `-2`, ...) until the server assigns a real one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// Build the temporary id for sequence number `seq` (1-based)
    pub fn temporary(seq: u64) -> Self {
        Self(format!("-{}", seq))
    }

    /// True for client-generated ids that the server has not confirmed yet
    pub fn is_temporary(&self) -> bool {
        self.temporary_seq().is_some()
    }

    /// Sequence number of a temporary id
    pub fn temporary_seq(&self) -> Option<u64> {
        self.0
            .strip_prefix('-')
            .and_then(|rest| rest.parse::<u64>().ok())
            .filter(|seq| *seq > 0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Signed(i64),
            Unsigned(u64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Signed(n) => EntityId(n.to_string()),
            RawId::Unsigned(n) => EntityId(n.to_string()),
            RawId::Text(s) => EntityId::new(s),
        })
    }
}

/// A catalog entity as the server returns it
///
/// Only `id` is interpreted by the engine; every other field is carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: EntityId, fields: Map<String, Value>) -> Self {
        let mut entity = Self {
            id,
            fields: Map::new(),
        };
        entity.merge(&fields);
        entity
    }

    /// Merge `patch` into this entity, field by field (patch wins)
    ///
    /// An `id` key in the patch is ignored.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Human-friendly label used by the CLI
    pub fn display_name(&self) -> String {
        ["name", "title", "sku"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

/// Whether a value has been confirmed by the server
///
/// Every entity the engine surfaces is wrapped in this, so pending state
/// cannot be forgotten by downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "entity", rename_all = "lowercase")]
pub enum Projection<T> {
    /// Matches what the server last returned
    Confirmed(T),
    /// Created or modified locally and not yet confirmed
    Provisional(T),
}

impl<T> Projection<T> {
    pub fn get(&self) -> &T {
        match self {
            Projection::Confirmed(value) | Projection::Provisional(value) => value,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self {
            Projection::Confirmed(value) | Projection::Provisional(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Projection::Confirmed(value) | Projection::Provisional(value) => value,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Projection::Provisional(_))
    }

    /// Re-tag the value as provisional, keeping its contents
    pub fn into_provisional(self) -> Self {
        Projection::Provisional(self.into_inner())
    }
}

impl Projection<Entity> {
    pub fn id(&self) -> &EntityId {
        &self.get().id
    }
}

/// Parameters of a collection listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
    /// Filter and sort parameters forwarded to the server as-is
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl ListQuery {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// One page of the collection as returned by `GET /collection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub items: Vec<Entity>,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default = "first_page")]
    pub total_pages: u32,
    #[serde(default)]
    pub total_items: u64,
}

fn first_page() -> u32 {
    1
}
