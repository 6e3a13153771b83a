use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::report::{RejectedOperation, SyncReport};
use super::SyncContext;
use crate::cache::{CacheEntry, PageKey};
use crate::client::{ApiError, ApiResult, RetryClass};
use crate::models::{Entity, EntityId, ListQuery, Projection};
use crate::outbox::{OperationKind, PendingOperation};

type PassFuture = Shared<BoxFuture<'static, SyncReport>>;

/// Runs reconciliation passes, one at a time
pub struct Reconciler {
    ctx: Arc<SyncContext>,
    in_flight: Mutex<Option<PassFuture>>,
}

impl Reconciler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            in_flight: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<PassFuture>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a pass, or join the one already running
    ///
    /// The pass runs on its own task, so dropping the returned future does
    /// not stop it halfway.
    pub async fn sync(&self) -> SyncReport {
        let pass = {
            let mut slot = self.in_flight();
            match slot.as_ref() {
                Some(pass) if pass.peek().is_none() => {
                    debug!("Joining in-flight sync pass");
                    pass.clone()
                }
                _ => {
                    let pass = self.start_pass();
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };

        let report = pass.clone().await;

        let mut slot = self.in_flight();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pass)) {
            *slot = None;
        }
        report
    }

    /// True while a pass is running
    pub fn is_syncing(&self) -> bool {
        self.in_flight()
            .as_ref()
            .is_some_and(|pass| pass.peek().is_none())
    }

    fn start_pass(&self) -> PassFuture {
        let handle = tokio::spawn(run_pass(Arc::clone(&self.ctx)));
        async move {
            handle.await.unwrap_or_else(|e| {
                warn!("Sync pass aborted: {}", e);
                SyncReport::default()
            })
        }
        .boxed()
        .shared()
    }
}

async fn run_pass(ctx: Arc<SyncContext>) -> SyncReport {
    let mut report = SyncReport::default();

    let (deletes, others): (Vec<_>, Vec<_>) = ctx
        .outbox
        .list_pending()
        .into_iter()
        .partition(|op| op.kind == OperationKind::Delete);

    if !deletes.is_empty() || !others.is_empty() {
        info!(
            deletes = deletes.len(),
            others = others.len(),
            "Reconciling pending operations"
        );
    }

    let mut queue: VecDeque<PendingOperation> = deletes.into_iter().chain(others).collect();
    while let Some(queued) = queue.pop_front() {
        // The queue may have changed while earlier operations were in flight
        let Some(op) = ctx.outbox.get(queued.id) else {
            debug!(op = %queued.id, "Operation no longer queued");
            report.skipped += 1;
            continue;
        };
        if op.awaits_create() {
            debug!(op = %op.id, "Waiting for the entity's create");
            report.skipped += 1;
            continue;
        }

        match send(&ctx, &op).await {
            Ok(server_entity) => {
                if !ctx.outbox.complete(&op) {
                    match orphaned_create(&ctx, &op, server_entity) {
                        Some(delete) => queue.push_back(delete),
                        None => report.skipped += 1,
                    }
                    continue;
                }
                apply_success(&ctx, &op, server_entity);
                report.succeeded += 1;
            }
            Err(e) => match e.retry_class() {
                RetryClass::Retryable => {
                    debug!(op = %op.id, kind = %op.kind, "Will retry: {}", e);
                    if e.is_transport() {
                        ctx.monitor.note_server_unreachable();
                    }
                    report.failed += 1;
                }
                RetryClass::Rejected => {
                    if !ctx.outbox.remove(op.id) {
                        report.skipped += 1;
                        continue;
                    }
                    warn!(op = %op.id, kind = %op.kind, "Server rejected operation: {}", e);
                    apply_rejection(&ctx, &op);
                    report.failed += 1;
                    report.rejected.push(RejectedOperation {
                        operation_id: op.id,
                        kind: op.kind,
                        entity_id: op.target().cloned(),
                        status: e.status_code(),
                        message: e.to_string(),
                    });
                }
            },
        }
    }

    report.refreshed = refresh(&ctx).await;

    info!(%report, "Sync pass finished");
    report
}

/// Send one operation; a Delete of a missing entity counts as done
async fn send(ctx: &SyncContext, op: &PendingOperation) -> ApiResult<Option<Entity>> {
    let target = op.entity_id.as_ref();
    match (op.kind, target) {
        (OperationKind::Create, _) => ctx.api.create(&op.payload).await.map(Some),
        (OperationKind::Update, Some(id)) => ctx.api.update(id, &op.payload).await.map(Some),
        (OperationKind::Delete, Some(id)) => match ctx.api.delete(id).await {
            Ok(()) => Ok(None),
            Err(e) if e.is_not_found() => {
                debug!(%id, "Already deleted on the server");
                Ok(None)
            }
            Err(e) => Err(e),
        },
        (_, None) => Err(ApiError::Decode(format!(
            "operation {} has no server id",
            op.id
        ))),
    }
}

fn apply_success(ctx: &SyncContext, op: &PendingOperation, server_entity: Option<Entity>) {
    match (op.kind, server_entity) {
        (OperationKind::Create, Some(created)) => {
            let Some(temp) = op.temp_id.as_ref() else {
                return;
            };
            let server_id = created.id.clone();
            ctx.outbox.rewrite_target(temp, &server_id);

            let projection = with_pending_fields(ctx, created);
            ctx.cache
                .replace_entity(temp, &CacheEntry::from_projection(&projection));
            ctx.working.replace_id(temp, projection);
            info!(%temp, %server_id, "Created entity confirmed");
        }
        (OperationKind::Update, Some(updated)) => {
            let id = updated.id.clone();
            let projection = with_pending_fields(ctx, updated);
            ctx.cache
                .replace_entity(&id, &CacheEntry::from_projection(&projection));
            ctx.working.replace_id(&id, projection);
        }
        (OperationKind::Delete, _) => {
            let Some(id) = op.target() else {
                return;
            };
            if !ctx.outbox.has_pending_for(id) {
                ctx.registry.confirm_deleted(id);
            }
            ctx.working.remove(id);
            ctx.cache.remove_entity(id);
        }
        (kind, None) => debug!(%kind, "Server returned no entity"),
    }
}

/// A Create the user deleted while it was in flight
///
/// The server now holds an entity nobody wants. Its id is tombstoned and a
/// Delete for it is queued; the returned operation is sent in this pass.
fn orphaned_create(
    ctx: &SyncContext,
    op: &PendingOperation,
    server_entity: Option<Entity>,
) -> Option<PendingOperation> {
    let created = server_entity.filter(|_| op.kind == OperationKind::Create)?;
    if !ctx.outbox.take_cancelled(op.id) {
        return None;
    }

    let server_id = created.id;
    info!(%server_id, "Deleting entity created after it was deleted locally");
    if let Some(temp) = op.temp_id.as_ref() {
        ctx.working.remove(temp);
        ctx.cache.remove_entity(temp);
    }
    if let Err(e) = ctx.registry.mark_deleted(&server_id) {
        warn!(%server_id, "Tombstone not stored: {}", e);
    }

    let delete = PendingOperation::delete(server_id.clone());
    match ctx.outbox.enqueue(delete.clone()) {
        Ok(_) => Some(delete),
        Err(e) => {
            warn!(%server_id, "Cannot queue delete: {}", e);
            None
        }
    }
}

/// Server copy, overlaid with fields still queued for it
fn with_pending_fields(ctx: &SyncContext, mut entity: Entity) -> Projection<Entity> {
    let pending = ctx.outbox.targets(&entity.id);
    if pending.is_empty() {
        return Projection::Confirmed(entity);
    }
    for op in &pending {
        entity.merge(&op.payload);
    }
    Projection::Provisional(entity)
}

fn apply_rejection(ctx: &SyncContext, op: &PendingOperation) {
    let Some(target) = op.target() else {
        return;
    };
    match op.kind {
        OperationKind::Create => {
            // The entity never existed on the server
            ctx.working.remove(target);
            ctx.cache.remove_entity(target);
        }
        OperationKind::Delete => {
            // Let the refresh bring the entity back
            ctx.registry.release(target);
        }
        OperationKind::Update => {}
    }
}

/// Reload the first page of the active listing from the server
async fn refresh(ctx: &SyncContext) -> bool {
    let query = ListQuery {
        page: 1,
        ..ctx.working.query()
    };

    match ctx.api.list(&query).await {
        Ok(page) => {
            let pending = ctx.outbox.list_pending();
            let items = ctx
                .working
                .rebase(query.clone(), page.items.clone(), &pending);
            ctx.cache.write(&PageKey::for_query(&query), &items);
            ctx.cache.write_meta(&page);
            true
        }
        Err(e) => {
            debug!("Refresh after sync failed: {}", e);
            if e.is_transport() {
                ctx.monitor.note_server_unreachable();
            }
            false
        }
    }
}
