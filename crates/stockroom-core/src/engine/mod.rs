//! Sync engine facade
//!
//! `SyncEngine` owns every component and is the only thing a host talks to.
//!
//! ## Mutations
//!
//! When the server is reachable and nothing is queued for the target, a
//! mutation goes straight to the server and returns
//! [`Projection::Confirmed`]. Otherwise (or when the direct request fails
//! for a retryable reason) it is queued in the outbox, applied locally, and
//! returned as [`Projection::Provisional`]. Only an authoritative rejection
//! from the server is an error.
//!
//! ## Background work
//!
//! [`SyncEngine::start`] spawns the probe loop and, when a realtime URL is
//! configured, the push channel. Every `WentOnline` transition starts a
//! reconciliation pass; every `WentOffline` transition snapshots the
//! working list into the cache.

mod error;
mod temp_id;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::availability::{
    AvailabilityMonitor, AvailabilityState, MonitorHandle, Subscription, Transition,
};
use crate::cache::{CacheEntry, CacheMeta, LocalCache, PageKey};
use crate::client::{ApiError, CatalogApi, HttpCatalogClient, RetryClass};
use crate::config::Config;
use crate::models::{Entity, EntityId, ListQuery, Projection};
use crate::outbox::{EnqueueOutcome, OperationKind, Outbox, PendingOperation};
use crate::realtime::{
    spawn_channel, ChannelCommand, ChannelConfig, ChannelEvent, ChannelHandle, ConnectionStatus,
    RealtimeIngestor,
};
use crate::registry::DeletionRegistry;
use crate::storage::{KvStore, StorageResult};
use crate::sync::{Reconciler, SyncContext, SyncReport};
use crate::working::WorkingSet;

pub use error::{EngineError, EngineResult};
pub use temp_id::{TempIdAllocator, TEMP_ID_SEQ_KEY};

/// One page of entities as shown to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub items: Vec<Projection<Entity>>,
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
    /// Served from the local cache because the server was not reachable
    pub from_cache: bool,
}

struct RealtimeTask {
    command_tx: mpsc::Sender<ChannelCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    pump: JoinHandle<()>,
}

struct Background {
    monitor: MonitorHandle,
    realtime: Option<RealtimeTask>,
}

/// Offline-first catalog engine
pub struct SyncEngine {
    config: Config,
    ctx: Arc<SyncContext>,
    reconciler: Arc<Reconciler>,
    ingestor: Arc<RealtimeIngestor>,
    temp_ids: TempIdAllocator,
    reports: Arc<watch::Sender<Option<SyncReport>>>,
    background: Mutex<Option<Background>>,
    _transitions: Subscription,
}

impl SyncEngine {
    /// Open the engine on the configured database and server
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_data_dir()?;

        let store = KvStore::open(&config.database_path(), config.storage_quota_bytes)
            .context("Failed to open local store")?;
        let api = HttpCatalogClient::from_config(&config).context("Failed to create HTTP client")?;

        Self::new(config, Arc::new(store), Arc::new(api)).context("Failed to load local state")
    }

    /// Build the engine from its collaborators
    ///
    /// Queued operations, tombstones and cached pages are read back from
    /// `store`; the working list starts from the cached first page.
    pub fn new(config: Config, store: Arc<KvStore>, api: Arc<dyn CatalogApi>) -> StorageResult<Self> {
        let registry = Arc::new(DeletionRegistry::load(Arc::clone(&store))?);
        let outbox = Arc::new(Outbox::load(Arc::clone(&store))?);
        let cache = Arc::new(
            LocalCache::new(Arc::clone(&store), Arc::clone(&registry), config.read_all_cap)
                .with_max_pages(config.cache_max_pages),
        );
        let temp_ids = TempIdAllocator::load(Arc::clone(&store), &outbox.list_pending())?;

        let query = ListQuery::new(1, config.page_size);
        let working = Arc::new(WorkingSet::new(Arc::clone(&registry), query.clone()));
        if let Some(entries) = cache.read(&PageKey::for_query(&query)) {
            let items = entries.into_iter().map(CacheEntry::into_projection).collect();
            working.replace(query, items);
        }

        let monitor = Arc::new(AvailabilityMonitor::from_config(Arc::clone(&api), &config));
        let ctx = Arc::new(SyncContext {
            api,
            monitor: Arc::clone(&monitor),
            outbox,
            registry: Arc::clone(&registry),
            cache: Arc::clone(&cache),
            working: Arc::clone(&working),
        });
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&ctx)));
        let ingestor = Arc::new(RealtimeIngestor::new(
            registry,
            Arc::clone(&cache),
            Arc::clone(&working),
        ));

        let (reports, _) = watch::channel(None);
        let reports = Arc::new(reports);
        let transitions = monitor.on_change(transition_handler(
            Arc::downgrade(&reconciler),
            Arc::clone(&reports),
            cache,
            working,
        ));

        Ok(Self {
            config,
            ctx,
            reconciler,
            ingestor,
            temp_ids,
            reports,
            background: Mutex::new(None),
            _transitions: transitions,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn background(&self) -> MutexGuard<'_, Option<Background>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Lifecycle ====================

    /// Start the probe loop and the realtime channel
    pub fn start(&self) {
        let mut background = self.background();
        if background.is_some() {
            debug!("Engine already started");
            return;
        }

        let monitor = self.ctx.monitor.spawn(self.config.probe_interval());
        let realtime = ChannelConfig::from_config(&self.config).map(|config| self.spawn_realtime(config));
        *background = Some(Background { monitor, realtime });
        info!("Engine started");
    }

    fn spawn_realtime(&self, config: ChannelConfig) -> RealtimeTask {
        let ChannelHandle {
            command_tx,
            mut event_rx,
            status_rx,
        } = spawn_channel(config);

        let ingestor = Arc::clone(&self.ingestor);
        let reply_tx = command_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    ChannelEvent::Message(envelope) => {
                        if let Some(reply) = ingestor.on_message(&envelope) {
                            let _ = reply_tx.send(ChannelCommand::Send(reply)).await;
                        }
                    }
                    ChannelEvent::StatusChanged(status) => debug!(?status, "Realtime status"),
                    ChannelEvent::Error(e) => debug!("Realtime channel: {}", e),
                }
            }
        });

        RealtimeTask {
            command_tx,
            status_rx,
            pump,
        }
    }

    /// Stop background tasks and wait for them
    pub async fn shutdown(&self) {
        let Some(background) = self.background().take() else {
            return;
        };

        background.monitor.shutdown().await;
        if let Some(realtime) = background.realtime {
            let _ = realtime.command_tx.send(ChannelCommand::Shutdown).await;
            let _ = realtime.pump.await;
        }
        info!("Engine stopped");
    }

    /// Realtime connection status, if the channel is running
    pub fn realtime_status(&self) -> Option<ConnectionStatus> {
        self.background()
            .as_ref()
            .and_then(|bg| bg.realtime.as_ref())
            .map(|realtime| *realtime.status_rx.borrow())
    }

    // ==================== Availability ====================

    pub fn state(&self) -> AvailabilityState {
        self.ctx.monitor.state()
    }

    pub fn is_online(&self) -> bool {
        self.ctx.monitor.is_online()
    }

    /// Feed the platform connectivity signal
    pub fn set_transport_online(&self, online: bool) {
        self.ctx.monitor.set_transport_online(online);
    }

    pub async fn probe_server_now(&self) -> bool {
        self.ctx.monitor.probe_server_now().await
    }

    pub fn on_change(&self, listener: impl Fn(Transition) + Send + Sync + 'static) -> Subscription {
        self.ctx.monitor.on_change(listener)
    }

    pub fn subscribe_availability(&self) -> watch::Receiver<AvailabilityState> {
        self.ctx.monitor.subscribe()
    }

    /// Receiver for the report of every finished pass
    pub fn subscribe_reports(&self) -> watch::Receiver<Option<SyncReport>> {
        self.reports.subscribe()
    }

    // ==================== Reads ====================

    /// List one page of the collection
    ///
    /// Served by the server when it is reachable, otherwise from the cache.
    /// The page becomes the working list either way.
    pub async fn list(&self, query: ListQuery) -> EngineResult<Listing> {
        if self.is_online() {
            match self.ctx.api.list(&query).await {
                Ok(page) => {
                    let pending = self.ctx.outbox.list_pending();
                    let items = self
                        .ctx
                        .working
                        .rebase(query.clone(), page.items.clone(), &pending);
                    self.ctx.cache.write(&PageKey::for_query(&query), &items);
                    self.ctx.cache.write_meta(&page);
                    return Ok(Listing {
                        items,
                        current_page: page.current_page,
                        total_pages: page.total_pages,
                        total_items: page.total_items,
                        from_cache: false,
                    });
                }
                Err(e) => self.fall_back(&e)?,
            }
        }

        Ok(self.cached_listing(query))
    }

    fn cached_listing(&self, query: ListQuery) -> Listing {
        let items: Vec<Projection<Entity>> = match self.ctx.cache.read(&PageKey::for_query(&query)) {
            Some(entries) => entries.into_iter().map(CacheEntry::into_projection).collect(),
            None if query == self.ctx.working.query() => self.ctx.working.snapshot(),
            None => Vec::new(),
        };
        self.ctx.working.replace(query.clone(), items.clone());

        let meta = self.ctx.cache.meta();
        Listing {
            current_page: query.page,
            total_pages: meta.as_ref().map_or(1, |m| m.total_pages),
            total_items: meta.map_or(items.len() as u64, |m| m.total_items),
            items,
            from_cache: true,
        }
    }

    /// The working list as currently shown
    pub fn entities(&self) -> Vec<Projection<Entity>> {
        self.ctx.working.snapshot()
    }

    /// Every cached entity, newest pages first
    pub fn cached_entities(&self, limit: usize) -> Vec<Projection<Entity>> {
        self.ctx
            .cache
            .read_all(limit)
            .into_iter()
            .map(CacheEntry::into_projection)
            .collect()
    }

    pub fn cache_meta(&self) -> Option<CacheMeta> {
        self.ctx.cache.meta()
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.ctx.outbox.list_pending()
    }

    pub fn pending_count(&self) -> usize {
        self.ctx.outbox.len()
    }

    pub fn deleted_ids(&self) -> Vec<EntityId> {
        self.ctx.registry.ids()
    }

    // ==================== Mutations ====================

    /// True when a mutation of `target` may go straight to the server
    fn can_send_directly(&self, target: &EntityId) -> bool {
        self.is_online() && !target.is_temporary() && !self.ctx.outbox.has_pending_for(target)
    }

    /// Turn a failed direct request into either an error or a fallback
    fn fall_back(&self, error: &ApiError) -> EngineResult<()> {
        match error.retry_class() {
            RetryClass::Rejected => Err(EngineError::rejected(error)),
            RetryClass::Retryable => {
                if error.is_transport() {
                    self.ctx.monitor.note_server_unreachable();
                }
                debug!("Falling back to local state: {}", error);
                Ok(())
            }
        }
    }

    fn snapshot(&self) {
        self.ctx
            .cache
            .write(&self.ctx.working.page_key(), &self.ctx.working.snapshot());
    }

    pub async fn create(&self, fields: Map<String, Value>) -> EngineResult<Projection<Entity>> {
        if self.is_online() {
            match self.ctx.api.create(&fields).await {
                Ok(entity) => {
                    info!(id = %entity.id, "Created entity");
                    let projection = Projection::Confirmed(entity);
                    self.ctx.working.upsert(projection.clone());
                    self.snapshot();
                    return Ok(projection);
                }
                Err(e) => self.fall_back(&e)?,
            }
        }

        let temp_id = self.temp_ids.next();
        self.ctx
            .outbox
            .enqueue(PendingOperation::create(temp_id.clone(), fields.clone()))?;
        info!(id = %temp_id, "Queued create");

        let projection = Projection::Provisional(Entity::new(temp_id, fields));
        self.ctx.working.upsert(projection.clone());
        self.snapshot();
        Ok(projection)
    }

    pub async fn update(
        &self,
        id: &EntityId,
        fields: Map<String, Value>,
    ) -> EngineResult<Projection<Entity>> {
        if self.ctx.registry.is_deleted(id) {
            // A queued Delete absorbs anything that follows it
            debug!(%id, "Update of a deleted entity discarded");
            return Ok(Projection::Provisional(Entity::new(id.clone(), fields)));
        }

        if self.can_send_directly(id) {
            match self.ctx.api.update(id, &fields).await {
                Ok(entity) => {
                    debug!(%id, "Updated entity");
                    let projection = Projection::Confirmed(entity);
                    self.ctx
                        .cache
                        .replace_entity(id, &CacheEntry::from_projection(&projection));
                    self.ctx.working.upsert(projection.clone());
                    self.snapshot();
                    return Ok(projection);
                }
                Err(e) => self.fall_back(&e)?,
            }
        }

        self.ctx
            .outbox
            .enqueue(PendingOperation::update(id.clone(), fields.clone()))?;
        info!(%id, "Queued update");

        let projection = match self.ctx.working.merge_fields(id, &fields) {
            Some(merged) => {
                let projection = merged.into_provisional();
                self.ctx.working.upsert(projection.clone());
                projection
            }
            None => {
                let mut entity = self
                    .cached_entities(usize::MAX)
                    .into_iter()
                    .find(|cached| cached.id() == id)
                    .map(Projection::into_inner)
                    .unwrap_or_else(|| Entity::new(id.clone(), Map::new()));
                entity.merge(&fields);
                Projection::Provisional(entity)
            }
        };
        self.ctx
            .cache
            .replace_entity(id, &CacheEntry::from_projection(&projection));
        self.snapshot();
        Ok(projection)
    }

    /// Delete an entity
    ///
    /// The entity disappears from every read immediately. Deleting an
    /// entity that is already pending deletion is a no-op. If the server
    /// rejects a direct delete the tombstone is released and the next
    /// listing shows the entity again.
    pub async fn delete(&self, id: &EntityId) -> EngineResult<Projection<EntityId>> {
        if self.ctx.registry.is_deleted(id) {
            return Ok(Projection::Provisional(id.clone()));
        }
        if id.is_temporary() && !self.ctx.outbox.has_pending_for(id) {
            // Never reached the server and nothing left to cancel
            self.ctx.working.remove(id);
            self.ctx.cache.remove_entity(id);
            return Ok(Projection::Confirmed(id.clone()));
        }

        self.ctx.registry.mark_deleted(id)?;
        self.ctx.working.remove(id);
        self.ctx.cache.remove_entity(id);

        if self.can_send_directly(id) {
            match self.ctx.api.delete(id).await {
                Ok(()) => return Ok(self.confirm_deleted(id)),
                Err(e) if e.is_not_found() => return Ok(self.confirm_deleted(id)),
                Err(e) => {
                    if let Err(err) = self.fall_back(&e) {
                        self.ctx.registry.release(id);
                        return Err(err);
                    }
                }
            }
        }

        match self.ctx.outbox.enqueue(PendingOperation::delete(id.clone())) {
            Ok(EnqueueOutcome::Cancelled) => {
                debug!(%id, "Delete cancelled a queued create");
                self.ctx.registry.release(id);
                // A create already in flight is deleted by the running pass
                if self.reconciler.is_syncing() {
                    Ok(Projection::Provisional(id.clone()))
                } else {
                    Ok(Projection::Confirmed(id.clone()))
                }
            }
            Ok(_) => {
                info!(%id, "Queued delete");
                Ok(Projection::Provisional(id.clone()))
            }
            Err(e) => {
                self.ctx.registry.release(id);
                Err(e.into())
            }
        }
    }

    fn confirm_deleted(&self, id: &EntityId) -> Projection<EntityId> {
        info!(%id, "Deleted entity");
        self.ctx.registry.confirm_deleted(id);
        Projection::Confirmed(id.clone())
    }

    // ==================== Administration ====================

    /// Reconcile the outbox with the server now
    ///
    /// Probes first when the server is not known to be reachable. Joins a
    /// pass that is already running instead of starting another.
    pub async fn sync(&self) -> SyncReport {
        if !self.is_online() && !self.probe_server_now().await {
            info!("Server unreachable, sync postponed");
            return SyncReport {
                skipped: self.ctx.outbox.len(),
                ..SyncReport::default()
            };
        }

        let report = self.reconciler.sync().await;
        self.reports.send_replace(Some(report.clone()));
        report
    }

    pub fn is_syncing(&self) -> bool {
        self.reconciler.is_syncing()
    }

    /// Drop every queued operation and undo its local effects
    ///
    /// Entities created offline disappear and tombstones of dropped
    /// deletes are released. A pass in flight stops applying results for
    /// the dropped operations. Returns how many operations were dropped.
    pub fn clear_pending(&self) -> usize {
        let dropped = self.ctx.outbox.clear();

        for op in &dropped {
            let Some(target) = op.target() else {
                continue;
            };
            if op.kind == OperationKind::Delete {
                self.ctx.registry.release(target);
            }
            if target.is_temporary() {
                self.ctx.cache.remove_entity(target);
            }
        }
        for id in self.ctx.working.remove_temporary() {
            self.ctx.cache.remove_entity(&id);
        }
        self.snapshot();

        info!(dropped = dropped.len(), "Cleared pending operations");
        dropped.len()
    }

    /// Forget every tombstone; returns how many were released
    pub fn restore_all_deleted(&self) -> usize {
        let released = self.ctx.registry.restore_all();
        info!(released, "Restored deleted entities");
        released
    }
}

/// React to availability transitions
///
/// Holds the reconciler weakly so the monitor's listener list does not
/// keep the engine alive.
fn transition_handler(
    reconciler: Weak<Reconciler>,
    reports: Arc<watch::Sender<Option<SyncReport>>>,
    cache: Arc<LocalCache>,
    working: Arc<WorkingSet>,
) -> impl Fn(Transition) + Send + Sync + 'static {
    move |transition| match transition {
        Transition::WentOnline => {
            let Some(reconciler) = reconciler.upgrade() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                debug!("No runtime, sync deferred to the next call");
                return;
            };
            let reports = Arc::clone(&reports);
            runtime.spawn(async move {
                let report = reconciler.sync().await;
                reports.send_replace(Some(report));
            });
        }
        Transition::WentOffline => {
            cache.write(&working.page_key(), &working.snapshot());
        }
    }
}
