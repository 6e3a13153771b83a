//! In-memory working list
//!
//! The entities the host is currently showing, for the active listing
//! query. Local mutations, realtime events and refreshes after a sync all
//! edit this list; the cache snapshots it.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::cache::PageKey;
use crate::models::{Entity, EntityId, ListQuery, Projection};
use crate::outbox::{OperationKind, PendingOperation};
use crate::registry::DeletionRegistry;

struct WorkingState {
    items: Vec<Projection<Entity>>,
    query: ListQuery,
}

pub struct WorkingSet {
    registry: Arc<DeletionRegistry>,
    state: Mutex<WorkingState>,
}

impl WorkingSet {
    pub fn new(registry: Arc<DeletionRegistry>, query: ListQuery) -> Self {
        Self {
            registry,
            state: Mutex::new(WorkingState {
                items: Vec::new(),
                query,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WorkingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn query(&self) -> ListQuery {
        self.state().query.clone()
    }

    pub fn page_key(&self) -> PageKey {
        PageKey::for_query(&self.state().query)
    }

    /// Replace the list with `items` fetched for `query`
    pub fn replace(&self, query: ListQuery, items: Vec<Projection<Entity>>) {
        let mut state = self.state();
        state.query = query;
        state.items = items;
    }

    /// Visible entities, tombstoned ones excluded
    pub fn snapshot(&self) -> Vec<Projection<Entity>> {
        let items = self.state().items.clone();
        self.registry.filter(items, |item| item.id())
    }

    pub fn get(&self, id: &EntityId) -> Option<Projection<Entity>> {
        if self.registry.is_deleted(id) {
            return None;
        }
        self.state().items.iter().find(|item| item.id() == id).cloned()
    }

    /// Put `item` at the top unless its id is present or tombstoned
    pub fn prepend_if_absent(&self, item: Projection<Entity>) -> bool {
        if self.registry.is_deleted(item.id()) {
            return false;
        }
        let mut state = self.state();
        if state.items.iter().any(|existing| existing.id() == item.id()) {
            return false;
        }
        state.items.insert(0, item);
        true
    }

    /// Merge `fields` into the entity with `id`, keeping its projection state
    pub fn merge_fields(&self, id: &EntityId, fields: &Map<String, Value>) -> Option<Projection<Entity>> {
        let mut state = self.state();
        let item = state.items.iter_mut().find(|item| item.id() == id)?;
        item.get_mut().merge(fields);
        Some(item.clone())
    }

    /// Replace the entity with the same id, or prepend it
    pub fn upsert(&self, item: Projection<Entity>) {
        let mut state = self.state();
        match state.items.iter().position(|existing| existing.id() == item.id()) {
            Some(index) => state.items[index] = item,
            None => state.items.insert(0, item),
        }
    }

    pub fn remove(&self, id: &EntityId) -> bool {
        let mut state = self.state();
        let before = state.items.len();
        state.items.retain(|item| item.id() != id);
        state.items.len() != before
    }

    /// Swap the entity known as `old_id` for `item`, keeping its position
    pub fn replace_id(&self, old_id: &EntityId, item: Projection<Entity>) -> bool {
        let mut state = self.state();
        if state.items.iter().any(|existing| existing.id() == item.id()) {
            state.items.retain(|existing| existing.id() != old_id);
            return false;
        }
        match state.items.iter_mut().find(|existing| existing.id() == old_id) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    /// Drop every entity that only exists locally (temporary id)
    pub fn remove_temporary(&self) -> Vec<EntityId> {
        let mut state = self.state();
        let removed: Vec<EntityId> = state
            .items
            .iter()
            .filter(|item| item.id().is_temporary())
            .map(|item| item.id().clone())
            .collect();
        state.items.retain(|item| !item.id().is_temporary());
        removed
    }

    /// Replace the list with server truth, replaying still-pending local work
    ///
    /// Entities created offline whose Create is still queued stay at the
    /// top. Server entities with a queued Update show the queued fields and
    /// stay provisional. Tombstoned ids are dropped.
    pub fn rebase(
        &self,
        query: ListQuery,
        server_items: Vec<Entity>,
        pending: &[PendingOperation],
    ) -> Vec<Projection<Entity>> {
        let mut state = self.state();
        state.query = query;

        let mut items: Vec<Projection<Entity>> = state
            .items
            .iter()
            .filter(|item| {
                pending
                    .iter()
                    .any(|op| op.kind == OperationKind::Create && op.targets(item.id()))
            })
            .cloned()
            .collect();

        for mut entity in server_items {
            if items.iter().any(|item| item.id() == &entity.id) {
                continue;
            }
            let update = pending
                .iter()
                .find(|op| op.kind == OperationKind::Update && op.targets(&entity.id));
            let item = match update {
                Some(op) => {
                    entity.merge(&op.payload);
                    Projection::Provisional(entity)
                }
                None => Projection::Confirmed(entity),
            };
            items.push(item);
        }

        state.items = self.registry.filter(items, |item| item.id());
        state.items.clone()
    }
}
