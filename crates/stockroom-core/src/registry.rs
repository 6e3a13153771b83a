//! Deletion registry (tombstones)
//!
//! Durable set of entity ids the user deleted locally. An id stays here
//! until the server confirms the deletion (reconciliation or a realtime
//! `ENTITY_DELETED` event) or the user restores everything. Every read
//! path filters against it, so a stale cache page or a late server
//! response cannot bring a deleted entity back.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::cache::PAGE_KEY_PREFIX;
use crate::models::EntityId;
use crate::storage::{KvStore, StorageResult};

/// Storage key of the registry
pub const REGISTRY_KEY: &str = "deletedEntityRegistry";

/// Durable set of locally deleted entity ids
pub struct DeletionRegistry {
    store: Arc<KvStore>,
    ids: Mutex<BTreeSet<EntityId>>,
}

impl DeletionRegistry {
    /// Load the registry from the store
    ///
    /// A corrupt stored value is backed up, logged and treated as empty.
    pub fn load(store: Arc<KvStore>) -> StorageResult<Self> {
        let ids = match store.get::<Vec<EntityId>>(REGISTRY_KEY) {
            Ok(ids) => ids.unwrap_or_default().into_iter().collect(),
            Err(e) if e.is_recoverable() => {
                warn!("Ignoring unreadable deletion registry: {}", e);
                store.back_up_raw(REGISTRY_KEY);
                BTreeSet::new()
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            ids: Mutex::new(ids),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<EntityId>> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a local deletion; returns true if the id was not already marked
    ///
    /// Cached pages are evicted if the store is full. When the tombstone
    /// still cannot be stored the id is left unmarked and the error returned.
    pub fn mark_deleted(&self, id: &EntityId) -> StorageResult<bool> {
        let mut ids = self.lock();
        if !ids.insert(id.clone()) {
            return Ok(false);
        }
        if let Err(e) = self.write(&ids) {
            ids.remove(id);
            return Err(e);
        }
        debug!(%id, "Marked deleted");
        Ok(true)
    }

    pub fn is_deleted(&self, id: &EntityId) -> bool {
        self.lock().contains(id)
    }

    /// The server agrees the entity is gone; drop the tombstone
    pub fn confirm_deleted(&self, id: &EntityId) -> bool {
        let removed = self.remove(id);
        if removed {
            debug!(%id, "Deletion confirmed");
        }
        removed
    }

    /// Drop a tombstone whose deletion the server refused
    pub fn release(&self, id: &EntityId) -> bool {
        let removed = self.remove(id);
        if removed {
            debug!(%id, "Deletion released");
        }
        removed
    }

    /// Forget every local deletion; returns how many were cleared
    pub fn restore_all(&self) -> usize {
        let mut ids = self.lock();
        let count = ids.len();
        ids.clear();
        self.persist(&ids);
        count
    }

    /// Keep only the items whose id is not tombstoned
    pub fn filter<T>(&self, items: Vec<T>, id_of: impl Fn(&T) -> &EntityId) -> Vec<T> {
        let ids = self.lock();
        if ids.is_empty() {
            return items;
        }
        items
            .into_iter()
            .filter(|item| !ids.contains(id_of(item)))
            .collect()
    }

    /// Snapshot of the tombstoned ids
    pub fn ids(&self) -> Vec<EntityId> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, id: &EntityId) -> bool {
        let mut ids = self.lock();
        let removed = ids.remove(id);
        if removed {
            self.persist(&ids);
        }
        removed
    }

    /// Write the full set while the lock is held, evicting cached pages if needed
    fn write(&self, ids: &BTreeSet<EntityId>) -> StorageResult<()> {
        let list: Vec<&EntityId> = ids.iter().collect();
        self.store
            .put_reclaiming(REGISTRY_KEY, &list, PAGE_KEY_PREFIX)
            .map(|_| ())
    }

    /// Write after a removal; a smaller set fits wherever the larger one did
    fn persist(&self, ids: &BTreeSet<EntityId>) {
        if let Err(e) = self.write(ids) {
            warn!("Deletion registry kept in memory only: {}", e);
        }
    }
}
