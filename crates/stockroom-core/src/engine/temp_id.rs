//! Temporary id allocation for entities created offline

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::models::EntityId;
use crate::outbox::PendingOperation;
use crate::storage::{KvStore, StorageResult};

/// Storage key of the last issued temporary sequence number
pub const TEMP_ID_SEQ_KEY: &str = "temp_id_seq";

/// Hands out `-1`, `-2`, ... and never repeats across restarts
pub struct TempIdAllocator {
    store: Arc<KvStore>,
    last: Mutex<u64>,
}

impl TempIdAllocator {
    /// Resume from the stored counter or the highest temporary id still
    /// queued, whichever is larger
    pub fn load(store: Arc<KvStore>, queued: &[PendingOperation]) -> StorageResult<Self> {
        let stored = store.get::<u64>(TEMP_ID_SEQ_KEY)?.unwrap_or(0);
        let highest_queued = queued
            .iter()
            .flat_map(|op| [op.temp_id.as_ref(), op.entity_id.as_ref()])
            .flatten()
            .filter_map(EntityId::temporary_seq)
            .max()
            .unwrap_or(0);

        Ok(Self {
            store,
            last: Mutex::new(stored.max(highest_queued)),
        })
    }

    pub fn next(&self) -> EntityId {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last += 1;
        // Losing the counter is survivable: it is re-seeded from the outbox
        if let Err(e) = self.store.put(TEMP_ID_SEQ_KEY, &*last) {
            warn!("Temporary id counter not persisted: {}", e);
        }
        EntityId::temporary(*last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_sequence_survives_reload() {
        let store = Arc::new(KvStore::open_in_memory(64 * 1024).unwrap());
        let ids = TempIdAllocator::load(Arc::clone(&store), &[]).unwrap();
        assert_eq!(ids.next(), EntityId::from("-1"));
        assert_eq!(ids.next(), EntityId::from("-2"));

        let reloaded = TempIdAllocator::load(store, &[]).unwrap();
        assert_eq!(reloaded.next(), EntityId::from("-3"));
    }

    #[test]
    fn test_seeded_from_queued_operations() {
        let store = Arc::new(KvStore::open_in_memory(64 * 1024).unwrap());
        let queued = vec![
            PendingOperation::create(EntityId::temporary(7), Map::new()),
            PendingOperation::update(EntityId::from(12), Map::new()),
        ];

        let ids = TempIdAllocator::load(store, &queued).unwrap();
        assert_eq!(ids.next(), EntityId::temporary(8));
    }
}
