//! Degrade ladder for durable cache writes
//!
//! When a page does not fit in the storage quota the cache retries with
//! fewer fields and fewer entities, one rung at a time, and finally gives
//! up on persisting the page. The in-memory copy is unaffected.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{CacheEntry, DurablePage};
use crate::storage::KvStore;

/// Fields kept by [`FieldProjection::Reduced`]
const REDUCED_FIELDS: &[&str] = &[
    "name",
    "price",
    "category",
    "stock",
    "sku",
    "images",
    "keywords",
    "updated_at",
    "updatedAt",
];

/// Fields dropped from the reduced set by [`FieldProjection::Minimal`]
const HEAVY_FIELDS: &[&str] = &["images", "keywords", "description"];

/// How much of an entity a cache entry keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldProjection {
    Full,
    Reduced,
    Minimal,
}

impl FieldProjection {
    pub fn apply(&self, fields: &Map<String, Value>) -> Map<String, Value> {
        match self {
            FieldProjection::Full => fields.clone(),
            FieldProjection::Reduced => Self::keep(fields, |key| REDUCED_FIELDS.contains(&key)),
            FieldProjection::Minimal => Self::keep(fields, |key| {
                REDUCED_FIELDS.contains(&key) && !HEAVY_FIELDS.contains(&key)
            }),
        }
    }

    fn keep(fields: &Map<String, Value>, wanted: impl Fn(&str) -> bool) -> Map<String, Value> {
        fields
            .iter()
            .filter(|(key, _)| wanted(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// One attempt of the ladder: a projection and an entity cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRung {
    pub projection: FieldProjection,
    pub cap: usize,
}

impl CacheRung {
    pub const fn new(projection: FieldProjection, cap: usize) -> Self {
        Self { projection, cap }
    }
}

/// Rungs tried for durable page writes, in order
pub fn default_durable_ladder() -> Vec<CacheRung> {
    vec![
        CacheRung::new(FieldProjection::Reduced, 50),
        CacheRung::new(FieldProjection::Minimal, 50),
        CacheRung::new(FieldProjection::Minimal, 20),
        CacheRung::new(FieldProjection::Minimal, 10),
    ]
}

/// Result of walking the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderOutcome {
    Persisted { rung: CacheRung, written: usize },
    Abandoned,
}

/// Write `entries` under `storage_key`, stepping down the ladder on capacity errors
pub fn persist_page(
    store: &KvStore,
    storage_key: &str,
    entries: &[CacheEntry],
    timestamp: DateTime<Utc>,
    ladder: &[CacheRung],
) -> LadderOutcome {
    for rung in ladder {
        let page = DurablePage {
            entities: entries
                .iter()
                .take(rung.cap)
                .map(|entry| entry.project(rung.projection))
                .collect(),
            timestamp,
        };
        let written = page.entities.len();

        match store.put(storage_key, &page) {
            Ok(()) => {
                debug!(key = storage_key, ?rung, written, "Cache page persisted");
                return LadderOutcome::Persisted {
                    rung: *rung,
                    written,
                };
            }
            Err(e) if e.is_capacity() => {
                debug!(key = storage_key, ?rung, "Cache page did not fit: {}", e);
            }
            Err(e) => {
                warn!(key = storage_key, "Cache page not persisted: {}", e);
                return LadderOutcome::Abandoned;
            }
        }
    }

    warn!(
        key = storage_key,
        entries = entries.len(),
        "Cache page kept in memory only; storage quota exhausted"
    );
    LadderOutcome::Abandoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityId;
    use serde_json::json;

    fn sample_fields() -> Map<String, Value> {
        json!({
            "name": "Mug",
            "price": 9.5,
            "description": "Stoneware",
            "images": ["a.jpg"],
            "keywords": ["kitchen"],
            "supplier": "ACME",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_projections() {
        let fields = sample_fields();

        assert_eq!(FieldProjection::Full.apply(&fields).len(), 6);

        let reduced = FieldProjection::Reduced.apply(&fields);
        assert!(reduced.contains_key("images"));
        assert!(!reduced.contains_key("supplier"));
        assert!(!reduced.contains_key("description"));

        let minimal = FieldProjection::Minimal.apply(&fields);
        let mut keys: Vec<_> = minimal.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["name", "price"]);
    }

    #[test]
    fn test_default_ladder_order() {
        let caps: Vec<_> = default_durable_ladder().iter().map(|r| r.cap).collect();
        assert_eq!(caps, vec![50, 50, 20, 10]);
        assert_eq!(default_durable_ladder()[0].projection, FieldProjection::Reduced);
    }

    #[test]
    fn test_first_rung_used_when_it_fits() {
        let store = KvStore::open_in_memory(64 * 1024).unwrap();
        let entries = vec![CacheEntry::new(EntityId::from(1), sample_fields(), false)];

        let outcome = persist_page(
            &store,
            "cache_page_1_x",
            &entries,
            Utc::now(),
            &default_durable_ladder(),
        );
        assert_eq!(
            outcome,
            LadderOutcome::Persisted {
                rung: CacheRung::new(FieldProjection::Reduced, 50),
                written: 1,
            }
        );
    }

    #[test]
    fn test_abandoned_when_nothing_fits() {
        let store = KvStore::open_in_memory(8).unwrap();
        let entries = vec![CacheEntry::new(EntityId::from(1), sample_fields(), false)];

        let outcome = persist_page(
            &store,
            "cache_page_1_x",
            &entries,
            Utc::now(),
            &default_durable_ladder(),
        );
        assert_eq!(outcome, LadderOutcome::Abandoned);
        assert!(store.get_raw("cache_page_1_x").unwrap().is_none());
    }
}
