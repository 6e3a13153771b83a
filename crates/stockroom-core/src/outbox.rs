//! Pending-operation outbox
//!
//! Mutations the server has not accepted yet, in the order the user made
//! them. The queue is coalesced at enqueue time so that at most one
//! effective operation exists per target entity:
//!
//! | queued | incoming | result |
//! |--------|----------|--------|
//! | Create | Update   | Create with merged payload |
//! | Create | Delete   | both dropped |
//! | Update | Update   | Update with merged payload |
//! | Update | Delete   | Delete in the Update's slot |
//! | Delete | any      | Delete kept, incoming dropped |
//!
//! The whole queue is written under `pendingOperations` after every change.
//! That key takes priority over cached pages: when the store is full, the
//! oldest pages are evicted to make room for it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::PAGE_KEY_PREFIX;
use crate::models::EntityId;
use crate::storage::{KvStore, StorageResult};

/// Storage key of the outbox
pub const OUTBOX_KEY: &str = "pendingOperations";

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation waiting for the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Server id of the target; unset while the target only has a temporary id
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    /// Temporary id of an entity created offline
    #[serde(default)]
    pub temp_id: Option<EntityId>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    fn new(kind: OperationKind, target: EntityId, payload: Map<String, Value>) -> Self {
        let (entity_id, temp_id) = if target.is_temporary() {
            (None, Some(target))
        } else {
            (Some(target), None)
        };

        Self {
            id: Uuid::new_v4(),
            kind,
            entity_id,
            temp_id,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    /// Create of an entity known locally as `temp_id`
    pub fn create(temp_id: EntityId, payload: Map<String, Value>) -> Self {
        Self::new(OperationKind::Create, temp_id, payload)
    }

    pub fn update(target: EntityId, payload: Map<String, Value>) -> Self {
        Self::new(OperationKind::Update, target, payload)
    }

    pub fn delete(target: EntityId) -> Self {
        Self::new(OperationKind::Delete, target, Map::new())
    }

    /// The entity this operation applies to
    pub fn target(&self) -> Option<&EntityId> {
        self.entity_id.as_ref().or(self.temp_id.as_ref())
    }

    pub fn targets(&self, id: &EntityId) -> bool {
        self.target() == Some(id)
    }

    /// An Update or Delete whose Create has not reached the server yet
    pub fn awaits_create(&self) -> bool {
        self.kind != OperationKind::Create && self.entity_id.is_none()
    }
}

/// What `enqueue` did with the incoming operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No operation for the target was queued; appended at the end
    Appended,
    /// Payload folded into the queued operation
    Merged,
    /// Queued Update replaced by the incoming Delete
    Superseded,
    /// A Delete is already queued; incoming dropped
    Discarded,
    /// Delete of an entity whose Create never reached the server; both dropped
    Cancelled,
}

/// Durable, coalescing queue of pending operations
pub struct Outbox {
    store: Arc<KvStore>,
    ops: Mutex<Vec<PendingOperation>>,
    /// Creates dropped by a Delete, in case one was already in flight
    cancelled_creates: Mutex<HashSet<Uuid>>,
    epoch: AtomicU64,
}

impl Outbox {
    /// Load the queue from the store
    ///
    /// A corrupt stored queue is copied to a backup key, logged and
    /// replaced by an empty one.
    pub fn load(store: Arc<KvStore>) -> StorageResult<Self> {
        let ops = match store.get::<Vec<PendingOperation>>(OUTBOX_KEY) {
            Ok(ops) => ops.unwrap_or_default(),
            Err(e) if e.is_recoverable() => {
                warn!("Ignoring unreadable outbox: {}", e);
                store.back_up_raw(OUTBOX_KEY);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            ops: Mutex::new(ops),
            cancelled_creates: Mutex::new(HashSet::new()),
            epoch: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        self.ops.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancelled_creates(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.cancelled_creates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `op`, coalescing with any operation on the same target
    ///
    /// If the new queue cannot be stored, the queue is left as it was and
    /// the error returned.
    pub fn enqueue(&self, op: PendingOperation) -> StorageResult<EnqueueOutcome> {
        let mut ops = self.lock();
        let before = ops.clone();
        let mut cancelled = None;

        let existing = op
            .target()
            .and_then(|target| ops.iter().position(|queued| queued.targets(target)));

        let outcome = match existing {
            None => {
                ops.push(op);
                EnqueueOutcome::Appended
            }
            Some(index) => {
                let queued_kind = ops[index].kind;
                match (queued_kind, op.kind) {
                    (OperationKind::Delete, _) => EnqueueOutcome::Discarded,
                    (OperationKind::Create, OperationKind::Delete) => {
                        cancelled = Some(ops.remove(index).id);
                        EnqueueOutcome::Cancelled
                    }
                    (OperationKind::Update, OperationKind::Delete) => {
                        ops[index] = op;
                        EnqueueOutcome::Superseded
                    }
                    (_, _) => {
                        let queued = &mut ops[index];
                        for (key, value) in op.payload {
                            queued.payload.insert(key, value);
                        }
                        EnqueueOutcome::Merged
                    }
                }
            }
        };

        if outcome != EnqueueOutcome::Discarded {
            if let Err(e) = self.write(&ops) {
                *ops = before;
                return Err(e);
            }
        }
        if let Some(create_id) = cancelled {
            self.cancelled_creates().insert(create_id);
        }

        debug!(?outcome, queued = ops.len(), "Enqueued operation");
        Ok(outcome)
    }

    /// True (once) if `op_id` was a Create cancelled by a later Delete
    pub fn take_cancelled(&self, op_id: Uuid) -> bool {
        self.cancelled_creates().remove(&op_id)
    }

    /// Snapshot of the queue in order
    pub fn list_pending(&self) -> Vec<PendingOperation> {
        self.lock().clone()
    }

    pub fn get(&self, op_id: Uuid) -> Option<PendingOperation> {
        self.lock().iter().find(|op| op.id == op_id).cloned()
    }

    pub fn contains(&self, op_id: Uuid) -> bool {
        self.lock().iter().any(|op| op.id == op_id)
    }

    /// Remove one operation; returns false if it was no longer queued
    pub fn remove(&self, op_id: Uuid) -> bool {
        let mut ops = self.lock();
        let before = ops.len();
        ops.retain(|op| op.id != op_id);
        let removed = ops.len() != before;
        if removed {
            self.persist(&ops);
        }
        removed
    }

    /// Settle an operation the server accepted
    ///
    /// Returns false if the operation is no longer queued. Fields merged
    /// into it while the request was in flight stay queued; a Create then
    /// becomes an Update of the same entity.
    pub fn complete(&self, sent: &PendingOperation) -> bool {
        let mut ops = self.lock();
        let Some(index) = ops.iter().position(|op| op.id == sent.id) else {
            return false;
        };

        if ops[index].payload == sent.payload {
            ops.remove(index);
        } else {
            let op = &mut ops[index];
            op.payload.retain(|key, value| sent.payload.get(key) != Some(value));
            if op.kind == OperationKind::Create {
                op.kind = OperationKind::Update;
            }
            debug!(op = %op.id, fields = op.payload.len(), "Kept fields changed in flight");
        }

        self.persist(&ops);
        true
    }

    /// Replace the whole queue
    pub fn replace_all(&self, new_ops: Vec<PendingOperation>) {
        let mut ops = self.lock();
        *ops = new_ops;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.persist(&ops);
    }

    /// Drop every queued operation; returns the dropped operations
    pub fn clear(&self) -> Vec<PendingOperation> {
        let mut ops = self.lock();
        let dropped = std::mem::take(&mut *ops);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.persist(&ops);
        dropped
    }

    /// Counter bumped whenever the queue is replaced or cleared wholesale
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Point operations that target `temp` at the server-assigned id
    ///
    /// Returns how many operations were rewritten.
    pub fn rewrite_target(&self, temp: &EntityId, server_id: &EntityId) -> usize {
        let mut ops = self.lock();
        let mut rewritten = 0;
        for op in ops.iter_mut().filter(|op| op.targets(temp)) {
            op.entity_id = Some(server_id.clone());
            op.temp_id = None;
            rewritten += 1;
        }

        if rewritten > 0 {
            debug!(%temp, %server_id, rewritten, "Rewrote temporary id");
            self.persist(&ops);
        }
        rewritten
    }

    /// True if any queued operation targets `id`
    pub fn has_pending_for(&self, id: &EntityId) -> bool {
        self.lock().iter().any(|op| op.targets(id))
    }

    /// Queued operations that target `id`
    pub fn targets(&self, id: &EntityId) -> Vec<PendingOperation> {
        self.lock()
            .iter()
            .filter(|op| op.targets(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn write(&self, ops: &[PendingOperation]) -> StorageResult<()> {
        self.store
            .put_reclaiming(OUTBOX_KEY, ops, PAGE_KEY_PREFIX)
            .map(|_| ())
    }

    /// Write a queue that shrank or was rewritten by the server's answer
    fn persist(&self, ops: &[PendingOperation]) {
        if let Err(e) = self.write(ops) {
            warn!("Outbox kept in memory only: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbox() -> (Arc<KvStore>, Outbox) {
        let store = Arc::new(KvStore::open_in_memory(256 * 1024).unwrap());
        let outbox = Outbox::load(Arc::clone(&store)).unwrap();
        (store, outbox)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_append_distinct_targets() {
        let (_store, outbox) = outbox();
        let a = outbox.enqueue(PendingOperation::update(EntityId::from(1), Map::new())).unwrap();
        let b = outbox.enqueue(PendingOperation::delete(EntityId::from(2))).unwrap();

        assert_eq!(a, EnqueueOutcome::Appended);
        assert_eq!(b, EnqueueOutcome::Appended);
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_create_then_update_merges() {
        let (_store, outbox) = outbox();
        let temp = EntityId::temporary(1);
        outbox.enqueue(PendingOperation::create(
            temp.clone(),
            fields(json!({"name": "Mug", "price": 5})),
        )).unwrap();

        let outcome = outbox.enqueue(PendingOperation::update(
            temp.clone(),
            fields(json!({"price": 7})),
        )).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Merged);
        let ops = outbox.list_pending();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].payload["name"], json!("Mug"));
        assert_eq!(ops[0].payload["price"], json!(7));
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let (_store, outbox) = outbox();
        let temp = EntityId::temporary(1);
        outbox.enqueue(PendingOperation::create(temp.clone(), Map::new())).unwrap();

        let outcome = outbox.enqueue(PendingOperation::delete(temp)).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_update_then_update_incoming_wins() {
        let (_store, outbox) = outbox();
        let id = EntityId::from(5);
        outbox.enqueue(PendingOperation::update(
            id.clone(),
            fields(json!({"name": "Old", "stock": 1})),
        )).unwrap();
        outbox.enqueue(PendingOperation::update(
            id.clone(),
            fields(json!({"name": "New"})),
        )).unwrap();

        let ops = outbox.targets(&id);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].payload["name"], json!("New"));
        assert_eq!(ops[0].payload["stock"], json!(1));
    }

    #[test]
    fn test_update_then_delete_keeps_slot() {
        let (_store, outbox) = outbox();
        outbox.enqueue(PendingOperation::update(EntityId::from(1), Map::new())).unwrap();
        outbox.enqueue(PendingOperation::update(EntityId::from(2), Map::new())).unwrap();

        let outcome = outbox.enqueue(PendingOperation::delete(EntityId::from(1))).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Superseded);

        let ops = outbox.list_pending();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OperationKind::Delete);
        assert!(ops[0].targets(&EntityId::from(1)));
        assert_eq!(ops[1].kind, OperationKind::Update);
    }

    #[test]
    fn test_delete_is_terminal() {
        let (_store, outbox) = outbox();
        let id = EntityId::from(9);
        outbox.enqueue(PendingOperation::delete(id.clone())).unwrap();

        assert_eq!(
            outbox.enqueue(PendingOperation::update(id.clone(), Map::new())).unwrap(),
            EnqueueOutcome::Discarded
        );
        assert_eq!(
            outbox.enqueue(PendingOperation::delete(id.clone())).unwrap(),
            EnqueueOutcome::Discarded
        );
        assert_eq!(outbox.targets(&id).len(), 1);
    }

    #[test]
    fn test_remove_reports_missing() {
        let (_store, outbox) = outbox();
        let op = PendingOperation::delete(EntityId::from(3));
        let op_id = op.id;
        outbox.enqueue(op).unwrap();

        assert!(outbox.remove(op_id));
        assert!(!outbox.remove(op_id));
    }

    #[test]
    fn test_complete_removes_sent_operation() {
        let (_store, outbox) = outbox();
        let op = PendingOperation::update(EntityId::from(1), fields(json!({"name": "A"})));
        outbox.enqueue(op.clone()).unwrap();

        assert!(outbox.complete(&op));
        assert!(outbox.is_empty());
        assert!(!outbox.complete(&op));
    }

    #[test]
    fn test_complete_keeps_fields_changed_in_flight() {
        let (_store, outbox) = outbox();
        let temp = EntityId::temporary(1);
        let sent = PendingOperation::create(temp.clone(), fields(json!({"name": "A", "price": 1})));
        outbox.enqueue(sent.clone()).unwrap();
        outbox.enqueue(PendingOperation::update(temp.clone(), fields(json!({"price": 2})))).unwrap();

        assert!(outbox.complete(&sent));

        let ops = outbox.list_pending();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Update);
        assert_eq!(ops[0].payload, fields(json!({"price": 2})));
        assert!(ops[0].awaits_create());
    }

    #[test]
    fn test_rewrite_target() {
        let (_store, outbox) = outbox();
        let temp = EntityId::temporary(1);
        outbox.enqueue(PendingOperation::update(temp.clone(), Map::new())).unwrap();

        assert!(outbox.list_pending()[0].awaits_create());
        assert_eq!(outbox.rewrite_target(&temp, &EntityId::from(42)), 1);

        let op = &outbox.list_pending()[0];
        assert_eq!(op.entity_id, Some(EntityId::from(42)));
        assert!(op.temp_id.is_none());
        assert!(!op.awaits_create());
        assert!(!outbox.has_pending_for(&temp));
    }

    #[test]
    fn test_survives_reload() {
        let (store, outbox) = outbox();
        outbox.enqueue(PendingOperation::create(
            EntityId::temporary(2),
            fields(json!({"name": "Lamp"})),
        )).unwrap();
        outbox.enqueue(PendingOperation::delete(EntityId::from(8))).unwrap();

        let reloaded = Outbox::load(store).unwrap();
        assert_eq!(reloaded.list_pending(), outbox.list_pending());
    }

    #[test]
    fn test_clear_bumps_epoch() {
        let (_store, outbox) = outbox();
        outbox.enqueue(PendingOperation::delete(EntityId::from(1))).unwrap();
        let epoch = outbox.epoch();

        let dropped = outbox.clear();
        assert_eq!(dropped.len(), 1);
        assert!(outbox.is_empty());
        assert_eq!(outbox.epoch(), epoch + 1);
    }

    #[test]
    fn test_cancelled_create_remembered_once() {
        let (_store, outbox) = outbox();
        let temp = EntityId::temporary(1);
        let create = PendingOperation::create(temp.clone(), Map::new());
        outbox.enqueue(create.clone()).unwrap();
        outbox.enqueue(PendingOperation::delete(temp)).unwrap();

        assert!(outbox.take_cancelled(create.id));
        assert!(!outbox.take_cancelled(create.id));
    }

    #[test]
    fn test_full_store_evicts_cached_pages() {
        let store = Arc::new(KvStore::open_in_memory(1024).unwrap());
        store.put_raw("cache_page_1_aa", &format!("\"{}\"", "x".repeat(900))).unwrap();
        let outbox = Outbox::load(Arc::clone(&store)).unwrap();

        let outcome = outbox
            .enqueue(PendingOperation::create(
                EntityId::temporary(1),
                fields(json!({"name": "y".repeat(200)})),
            ))
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Appended);
        assert!(store.get_raw("cache_page_1_aa").unwrap().is_none());
        assert_eq!(Outbox::load(store).unwrap().len(), 1);
    }

    #[test]
    fn test_unstorable_enqueue_leaves_queue_unchanged() {
        let store = Arc::new(KvStore::open_in_memory(400).unwrap());
        let outbox = Outbox::load(Arc::clone(&store)).unwrap();
        outbox.enqueue(PendingOperation::delete(EntityId::from(1))).unwrap();
        let before = outbox.list_pending();

        let err = outbox
            .enqueue(PendingOperation::update(
                EntityId::from(2),
                fields(json!({"description": "z".repeat(500)})),
            ))
            .unwrap_err();

        assert!(err.is_capacity());
        assert_eq!(outbox.list_pending(), before);
        assert_eq!(Outbox::load(store).unwrap().list_pending(), before);
    }

    #[test]
    fn test_corrupt_outbox_is_backed_up() {
        let store = Arc::new(KvStore::open_in_memory(1024).unwrap());
        store.put_raw(OUTBOX_KEY, "[{\"kind\":").unwrap();

        let outbox = Outbox::load(Arc::clone(&store)).unwrap();

        assert!(outbox.is_empty());
        let backup = format!("{}{}", OUTBOX_KEY, crate::storage::CORRUPT_SUFFIX);
        assert_eq!(store.get_raw(&backup).unwrap().as_deref(), Some("[{\"kind\":"));
    }

    #[test]
    fn test_serialized_shape() {
        let op = PendingOperation::create(EntityId::temporary(1), fields(json!({"name": "Cup"})));
        let value = serde_json::to_value(&op).unwrap();

        assert_eq!(value["kind"], json!("create"));
        assert_eq!(value["tempId"], json!("-1"));
        assert!(value["entityId"].is_null());
        assert!(value.get("enqueuedAt").is_some());
    }
}
