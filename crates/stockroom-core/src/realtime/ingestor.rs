//! Folds server push events into local state
//!
//! Events are applied to the working list and the cache regardless of what
//! is queued in the outbox. Applying the same event twice leaves the same
//! state as applying it once.

use std::sync::Arc;

use tracing::{debug, warn};

use super::message::{Envelope, RealtimeEvent};
use crate::cache::LocalCache;
use crate::models::Projection;
use crate::registry::DeletionRegistry;
use crate::working::WorkingSet;

pub struct RealtimeIngestor {
    registry: Arc<DeletionRegistry>,
    cache: Arc<LocalCache>,
    working: Arc<WorkingSet>,
}

impl RealtimeIngestor {
    pub fn new(
        registry: Arc<DeletionRegistry>,
        cache: Arc<LocalCache>,
        working: Arc<WorkingSet>,
    ) -> Self {
        Self {
            registry,
            cache,
            working,
        }
    }

    /// Apply one envelope; returns the reply to send, if any
    pub fn on_message(&self, envelope: &Envelope) -> Option<Envelope> {
        let event = match envelope.event() {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping realtime message: {}", e);
                return None;
            }
        };

        match event {
            RealtimeEvent::Created(entity) => {
                let id = entity.id.clone();
                if self.working.prepend_if_absent(Projection::Confirmed(entity)) {
                    debug!(%id, "Pushed entity added");
                    self.snapshot();
                }
            }
            RealtimeEvent::Updated(entity) => {
                if self.working.merge_fields(&entity.id, &entity.fields).is_some() {
                    debug!(id = %entity.id, "Pushed update applied");
                    self.snapshot();
                }
            }
            RealtimeEvent::Deleted(id) => {
                self.working.remove(&id);
                self.cache.remove_entity(&id);
                self.registry.confirm_deleted(&id);
                debug!(%id, "Pushed deletion applied");
            }
            RealtimeEvent::Ping => return Some(Envelope::pong()),
            RealtimeEvent::Pong => {}
        }

        None
    }

    fn snapshot(&self) {
        self.cache
            .write(&self.working.page_key(), &self.working.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_READ_ALL_CAP;
    use crate::models::{Entity, EntityId, ListQuery};
    use crate::realtime::message::{ENTITY_CREATED, ENTITY_DELETED, ENTITY_UPDATED};
    use crate::storage::KvStore;
    use serde_json::{json, Map};

    struct Parts {
        registry: Arc<DeletionRegistry>,
        cache: Arc<LocalCache>,
        working: Arc<WorkingSet>,
        ingestor: RealtimeIngestor,
    }

    fn parts() -> Parts {
        let store = Arc::new(KvStore::open_in_memory(256 * 1024).unwrap());
        let registry = Arc::new(DeletionRegistry::load(Arc::clone(&store)).unwrap());
        let cache = Arc::new(LocalCache::new(
            store,
            Arc::clone(&registry),
            DEFAULT_READ_ALL_CAP,
        ));
        let working = Arc::new(WorkingSet::new(Arc::clone(&registry), ListQuery::default()));
        let ingestor = RealtimeIngestor::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&working),
        );
        Parts {
            registry,
            cache,
            working,
            ingestor,
        }
    }

    #[test]
    fn test_created_is_idempotent() {
        let p = parts();
        let envelope = Envelope::new(ENTITY_CREATED, json!({"id": 1, "name": "Mug"}));

        assert!(p.ingestor.on_message(&envelope).is_none());
        p.ingestor.on_message(&envelope);

        assert_eq!(p.working.snapshot().len(), 1);
        assert_eq!(p.cache.read(&p.working.page_key()).unwrap().len(), 1);
    }

    #[test]
    fn test_created_ignores_tombstoned() {
        let p = parts();
        p.registry.mark_deleted(&EntityId::from(1)).unwrap();

        p.ingestor
            .on_message(&Envelope::new(ENTITY_CREATED, json!({"id": 1})));
        assert!(p.working.snapshot().is_empty());
    }

    #[test]
    fn test_updated_merges_only_known_entities() {
        let p = parts();
        p.working.upsert(Projection::Confirmed(Entity::new(
            EntityId::from(1),
            json!({"name": "Mug", "price": 5}).as_object().cloned().unwrap(),
        )));

        let update = Envelope::new(ENTITY_UPDATED, json!({"id": 1, "price": 6}));
        p.ingestor.on_message(&update);
        p.ingestor.on_message(&update);
        p.ingestor
            .on_message(&Envelope::new(ENTITY_UPDATED, json!({"id": 2, "price": 1})));

        let items = p.working.snapshot();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get().field("price"), Some(&json!(6)));
        assert_eq!(items[0].get().field("name"), Some(&json!("Mug")));
    }

    #[test]
    fn test_deleted_confirms_tombstone() {
        let p = parts();
        let id = EntityId::from(3);
        p.working.upsert(Projection::Confirmed(Entity::new(id.clone(), Map::new())));
        p.cache.write(&p.working.page_key(), &p.working.snapshot());
        p.registry.mark_deleted(&id).unwrap();

        let delete = Envelope::new(ENTITY_DELETED, json!({"id": 3}));
        p.ingestor.on_message(&delete);
        p.ingestor.on_message(&delete);

        assert!(!p.registry.is_deleted(&id));
        assert!(p.working.snapshot().is_empty());
        assert!(p.cache.read(&p.working.page_key()).unwrap().is_empty());
    }

    #[test]
    fn test_ping_gets_pong() {
        let p = parts();
        assert_eq!(p.ingestor.on_message(&Envelope::ping()), Some(Envelope::pong()));
        assert_eq!(p.ingestor.on_message(&Envelope::pong()), None);
    }

    #[test]
    fn test_malformed_envelope_dropped() {
        let p = parts();
        let missing_id = Envelope::new(ENTITY_CREATED, json!({"name": "No id"}));
        assert!(p.ingestor.on_message(&missing_id).is_none());
        assert!(p.ingestor.on_message(&Envelope::new("SOMETHING_ELSE", json!({}))).is_none());
        assert!(p.working.snapshot().is_empty());
    }
}
