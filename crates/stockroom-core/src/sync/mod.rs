//! Reconciliation with the catalog server
//!
//! Drains the outbox against the server and folds the result back into
//! the working list, the cache and the deletion registry.
//!
//! ## Pass
//!
//! 1. Snapshot the outbox, deletes first
//! 2. Send each operation in turn, re-checking that it is still queued
//! 3. Apply local effects of accepted operations (temp id rewrite, tombstone
//!    confirmation, cache update)
//! 4. Refresh the first page of the active listing from the server
//!
//! Only one pass runs at a time; callers arriving mid-pass get its report.

mod reconcile;
mod report;

use std::sync::Arc;

use crate::availability::AvailabilityMonitor;
use crate::cache::LocalCache;
use crate::client::CatalogApi;
use crate::outbox::Outbox;
use crate::registry::DeletionRegistry;
use crate::working::WorkingSet;

pub use reconcile::Reconciler;
pub use report::{RejectedOperation, SyncReport};

/// Everything a reconciliation pass reads and writes
pub struct SyncContext {
    pub api: Arc<dyn CatalogApi>,
    pub monitor: Arc<AvailabilityMonitor>,
    pub outbox: Arc<Outbox>,
    pub registry: Arc<DeletionRegistry>,
    pub cache: Arc<LocalCache>,
    pub working: Arc<WorkingSet>,
}
