//! Local cache
//!
//! Keeps the pages the user has looked at so they stay readable offline.
//! Each page lives twice: a full copy in memory for the running process and
//! a reduced copy in the durable store that survives restarts. Durable
//! writes go through the degrade ladder in [`ladder`] and never fail the
//! caller.
//!
//! At most `max_pages` pages are kept; writing a new one evicts the oldest,
//! in memory and in the store.
//!
//! Reads always drop entities tombstoned in the [`DeletionRegistry`].

pub mod key;
pub mod ladder;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{Entity, EntityId, ListPage, Projection};
use crate::registry::DeletionRegistry;
use crate::storage::KvStore;

pub use key::{fingerprint, PageKey, PAGE_KEY_PREFIX};
pub use ladder::{default_durable_ladder, CacheRung, FieldProjection, LadderOutcome};

/// Storage key of the paging metadata
pub const META_KEY: &str = "cache_meta";

/// Default cap on [`LocalCache::read_all`]
pub const DEFAULT_READ_ALL_CAP: usize = 500;

/// Default number of pages kept
pub const DEFAULT_MAX_PAGES: usize = 20;

/// One cached entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub is_provisional: bool,
}

impl CacheEntry {
    pub fn new(id: EntityId, fields: Map<String, Value>, is_provisional: bool) -> Self {
        Self {
            id,
            fields,
            is_provisional,
        }
    }

    pub fn from_projection(projection: &Projection<Entity>) -> Self {
        let entity = projection.get();
        Self::new(
            entity.id.clone(),
            entity.fields.clone(),
            projection.is_provisional(),
        )
    }

    pub fn into_projection(self) -> Projection<Entity> {
        let entity = Entity {
            id: self.id,
            fields: self.fields,
        };
        if self.is_provisional {
            Projection::Provisional(entity)
        } else {
            Projection::Confirmed(entity)
        }
    }

    /// Copy with only the fields `projection` keeps
    pub fn project(&self, projection: FieldProjection) -> Self {
        Self::new(
            self.id.clone(),
            projection.apply(&self.fields),
            self.is_provisional,
        )
    }
}

/// Page as written to the durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurablePage {
    pub entities: Vec<CacheEntry>,
    pub timestamp: DateTime<Utc>,
}

/// Page held in memory
#[derive(Debug, Clone)]
pub struct CachePage {
    pub key: PageKey,
    pub entities: Vec<CacheEntry>,
    pub captured_at: DateTime<Utc>,
    /// Write order within this process
    pub seq: u64,
}

/// Paging metadata of the last server listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
    pub last_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
    pub timestamp: DateTime<Utc>,
}

impl CacheMeta {
    pub fn from_page(page: &ListPage) -> Self {
        Self {
            last_page: page.current_page,
            total_pages: page.total_pages,
            total_items: page.total_items,
            timestamp: Utc::now(),
        }
    }
}

/// Quota-aware page cache
pub struct LocalCache {
    store: Arc<KvStore>,
    registry: Arc<DeletionRegistry>,
    pages: Mutex<HashMap<PageKey, CachePage>>,
    next_seq: AtomicU64,
    ladder: Vec<CacheRung>,
    read_all_cap: usize,
    max_pages: usize,
}

impl LocalCache {
    pub fn new(store: Arc<KvStore>, registry: Arc<DeletionRegistry>, read_all_cap: usize) -> Self {
        Self {
            store,
            registry,
            pages: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            ladder: default_durable_ladder(),
            read_all_cap,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Keep at most `max_pages` pages (at least one)
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn pages(&self) -> MutexGuard<'_, HashMap<PageKey, CachePage>> {
        self.pages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache `entities` as the contents of `key`
    ///
    /// The in-memory copy always succeeds; the returned outcome says how
    /// much of the page made it to durable storage.
    pub fn write(&self, key: &PageKey, entities: &[Projection<Entity>]) -> LadderOutcome {
        let entries: Vec<CacheEntry> = entities.iter().map(CacheEntry::from_projection).collect();
        let captured_at = Utc::now();

        self.pages().insert(
            key.clone(),
            CachePage {
                key: key.clone(),
                entities: entries.clone(),
                captured_at,
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            },
        );

        let outcome = ladder::persist_page(
            &self.store,
            &key.storage_key(),
            &entries,
            captured_at,
            &self.ladder,
        );
        self.evict_pages(key);
        outcome
    }

    /// Drop the oldest pages beyond `max_pages`, never `keep`
    fn evict_pages(&self, keep: &PageKey) {
        {
            let mut pages = self.pages();
            while pages.len() > self.max_pages {
                let oldest = pages
                    .values()
                    .filter(|page| &page.key != keep)
                    .min_by_key(|page| page.seq)
                    .map(|page| page.key.clone());
                let Some(oldest) = oldest else {
                    break;
                };
                pages.remove(&oldest);
            }
        }

        let keep = keep.storage_key();
        let keys = match self.store.keys_with_prefix(PAGE_KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cannot list durable cache pages: {}", e);
                return;
            }
        };
        // Newest first, so everything past the limit is older
        for key in keys
            .into_iter()
            .filter(|key| *key != keep)
            .skip(self.max_pages - 1)
        {
            match self.store.remove(&key) {
                Ok(_) => debug!(key = %key, "Evicted cached page"),
                Err(e) => warn!(key = %key, "Cannot evict cached page: {}", e),
            }
        }
    }

    /// Record paging metadata from a server listing
    pub fn write_meta(&self, page: &ListPage) {
        if let Err(e) = self.store.put(META_KEY, &CacheMeta::from_page(page)) {
            warn!("Cache metadata not persisted: {}", e);
        }
    }

    pub fn meta(&self) -> Option<CacheMeta> {
        match self.store.get(META_KEY) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Ignoring unreadable cache metadata: {}", e);
                None
            }
        }
    }

    /// Entities cached for `key`, memory first, then durable storage
    pub fn read(&self, key: &PageKey) -> Option<Vec<CacheEntry>> {
        let in_memory = self.pages().get(key).map(|page| page.entities.clone());
        let entries = match in_memory {
            Some(entries) => entries,
            None => self.read_durable(&key.storage_key())?.entities,
        };

        Some(self.registry.filter(entries, |entry| &entry.id))
    }

    /// Every cached entity, newest pages first, deduplicated by id
    ///
    /// At most `min(limit, read_all_cap)` entries are returned.
    pub fn read_all(&self, limit: usize) -> Vec<CacheEntry> {
        let cap = limit.min(self.read_all_cap);
        let mut seen = HashSet::new();
        let mut result = Vec::new();

        let mut memory: Vec<CachePage> = self.pages().values().cloned().collect();
        memory.sort_by(|a, b| b.seq.cmp(&a.seq));
        let memory_keys: HashSet<String> = memory.iter().map(|p| p.key.storage_key()).collect();

        let durable_keys = self.store.keys_with_prefix(PAGE_KEY_PREFIX).unwrap_or_else(|e| {
            warn!("Cannot list durable cache pages: {}", e);
            Vec::new()
        });
        let durable = durable_keys
            .iter()
            .filter(|key| !memory_keys.contains(*key))
            .filter_map(|key| self.read_durable(key));

        let sources = memory
            .into_iter()
            .map(|page| page.entities)
            .chain(durable.map(|page| page.entities));

        'pages: for entities in sources {
            for entry in entities {
                if result.len() >= cap {
                    break 'pages;
                }
                if self.registry.is_deleted(&entry.id) || !seen.insert(entry.id.clone()) {
                    continue;
                }
                result.push(entry);
            }
        }

        result
    }

    /// Drop `id` from every cached page; returns how many pages changed
    pub fn remove_entity(&self, id: &EntityId) -> usize {
        self.rewrite_pages(|entries| {
            let before = entries.len();
            entries.retain(|entry| &entry.id != id);
            entries.len() != before
        })
    }

    /// Replace the entry for `old_id` with `entry` in every cached page
    pub fn replace_entity(&self, old_id: &EntityId, entry: &CacheEntry) -> usize {
        self.rewrite_pages(|entries| {
            let mut changed = false;
            for slot in entries.iter_mut().filter(|slot| &slot.id == old_id) {
                *slot = entry.clone();
                changed = true;
            }
            changed
        })
    }

    fn rewrite_pages(&self, mut edit: impl FnMut(&mut Vec<CacheEntry>) -> bool) -> usize {
        let mut changed = 0;

        for page in self.pages().values_mut() {
            if edit(&mut page.entities) {
                changed += 1;
            }
        }

        let keys = self.store.keys_with_prefix(PAGE_KEY_PREFIX).unwrap_or_default();
        for key in keys {
            let Some(mut page) = self.read_durable(&key) else {
                continue;
            };
            if !edit(&mut page.entities) {
                continue;
            }
            changed += 1;
            if let Err(e) = self.store.put(&key, &page) {
                // A stale copy would show the old entity after a restart
                warn!(key = %key, "Dropping durable cache page: {}", e);
                if let Err(e) = self.store.remove(&key) {
                    warn!(key = %key, "Stale cache page left in place: {}", e);
                }
            }
        }

        debug!(changed, "Rewrote cached pages");
        changed
    }

    fn read_durable(&self, storage_key: &str) -> Option<DurablePage> {
        match self.store.get::<DurablePage>(storage_key) {
            Ok(page) => page,
            Err(e) => {
                warn!(key = storage_key, "Ignoring unreadable cache page: {}", e);
                None
            }
        }
    }
}
