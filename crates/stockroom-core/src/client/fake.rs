//! In-process catalog server for engine tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use super::{ApiError, ApiResult, CatalogApi};
use crate::models::{Entity, EntityId, ListPage, ListQuery};

/// One request the fake received
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List(u32),
    Create(Map<String, Value>),
    Update(EntityId),
    Delete(EntityId),
    Probe,
}

struct State {
    items: Vec<Entity>,
    next_id: i64,
    reachable: bool,
    probe_delay: Option<Duration>,
    /// Status returned for the next write touching an id (or any create, keyed "create")
    reject: HashMap<String, u16>,
    create_gate: Option<CreateGate>,
    calls: Vec<Call>,
}

/// Holds creates in flight until released
#[derive(Clone, Default)]
pub struct CreateGate {
    /// Signalled when a create reaches the gate
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct FakeCatalogApi {
    state: Mutex<State>,
}

impl FakeCatalogApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: Vec::new(),
                next_id: 100,
                reachable: true,
                probe_delay: None,
                reject: HashMap::new(),
                create_gate: None,
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the server with entities
    pub fn with_items(self, items: Vec<Entity>) -> Self {
        self.state().items = items;
        self
    }

    pub fn set_next_id(&self, id: i64) {
        self.state().next_id = id;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.state().probe_delay = Some(delay);
    }

    /// Answer writes to `target` (an id, or "create") with `status`
    pub fn reject(&self, target: &str, status: u16) {
        self.state().reject.insert(target.to_string(), status);
    }

    /// Hold every create until the returned gate is released
    pub fn gate_creates(&self) -> CreateGate {
        let gate = CreateGate::default();
        self.state().create_gate = Some(gate.clone());
        gate
    }

    pub fn items(&self) -> Vec<Entity> {
        self.state().items.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn probe_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::Probe).count()
    }

    /// Server-side insert, as if another client created the entity
    pub fn insert(&self, entity: Entity) {
        self.state().items.push(entity);
    }

    fn begin(&self, call: Call, target: &str) -> ApiResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(call);
        if !state.reachable {
            return Err(ApiError::Unreachable("connection refused".to_string()));
        }
        if let Some(status) = state.reject.get(target) {
            return Err(ApiError::status(*status, "rejected by fake server"));
        }
        Ok(state)
    }
}

#[async_trait]
impl CatalogApi for FakeCatalogApi {
    async fn list(&self, query: &ListQuery) -> ApiResult<ListPage> {
        let state = self.begin(Call::List(query.page), "list")?;
        let size = query.page_size as usize;
        let start = (query.page as usize - 1) * size;
        let total = state.items.len();

        Ok(ListPage {
            items: state.items.iter().skip(start).take(size).cloned().collect(),
            current_page: query.page,
            total_pages: total.div_ceil(size).max(1) as u32,
            total_items: total as u64,
        })
    }

    async fn create(&self, fields: &Map<String, Value>) -> ApiResult<Entity> {
        let gate = self.state().create_gate.clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.begin(Call::Create(fields.clone()), "create")?;
        let id = EntityId::from(state.next_id);
        state.next_id += 1;

        let entity = Entity::new(id, fields.clone());
        state.items.insert(0, entity.clone());
        Ok(entity)
    }

    async fn update(&self, id: &EntityId, fields: &Map<String, Value>) -> ApiResult<Entity> {
        let mut state = self.begin(Call::Update(id.clone()), id.as_str())?;
        let entity = state
            .items
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        entity.merge(fields);
        Ok(entity.clone())
    }

    async fn delete(&self, id: &EntityId) -> ApiResult<()> {
        let mut state = self.begin(Call::Delete(id.clone()), id.as_str())?;
        let before = state.items.len();
        state.items.retain(|e| &e.id != id);
        if state.items.len() == before {
            return Err(ApiError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn probe(&self) -> ApiResult<()> {
        let delay = {
            let mut state = self.state();
            state.calls.push(Call::Probe);
            state.probe_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state().reachable {
            Ok(())
        } else {
            Err(ApiError::Unreachable("connection refused".to_string()))
        }
    }
}
