//! Stockroom Core Library
//!
//! Offline-first synchronization for a retail catalog client. Users keep
//! browsing and editing the catalog while the network or the server is
//! unreliable; local changes are reconciled with the server once it is
//! reachable again, without duplicating, losing or resurrecting entities.
//!
//! # Architecture
//!
//! - **Availability monitor**: combines the platform connectivity signal
//!   with periodic server probes
//! - **Outbox**: durable, coalescing queue of mutations the server has not
//!   accepted yet
//! - **Local cache**: quota-aware page cache that degrades field sets and
//!   page sizes instead of failing
//! - **Deletion registry**: tombstones that keep deleted entities hidden
//!   until the server confirms them
//! - **Reconciler**: drains the outbox and refreshes from server truth
//! - **Realtime ingestor**: folds server push events into local state
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::open(Config::load()?)?;
//! engine.start();
//!
//! let created = engine.create(fields).await?;
//! if created.is_provisional() {
//!     // queued, will be sent when the server is reachable
//! }
//! ```
//!
//! # Modules
//!
//! - `engine`: the facade hosts talk to (main entry point)
//! - `models`: entity ids, entities, projections and listing queries
//! - `storage`: quota-bounded key/value store on SQLite
//! - `client`: catalog REST client
//! - `config`: application configuration

pub mod availability;
pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod models;
pub mod outbox;
pub mod realtime;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod working;

pub use availability::{AvailabilityMonitor, AvailabilityState, Subscription, Transition};
pub use cache::{CacheEntry, CacheMeta, LocalCache, PageKey};
pub use client::{ApiError, CatalogApi, HttpCatalogClient, RetryClass};
pub use config::Config;
pub use engine::{EngineError, EngineResult, Listing, SyncEngine};
pub use models::{Entity, EntityId, ListPage, ListQuery, Projection};
pub use outbox::{EnqueueOutcome, OperationKind, Outbox, PendingOperation};
pub use realtime::{ConnectionStatus, Envelope, RealtimeEvent, RealtimeIngestor};
pub use registry::DeletionRegistry;
pub use storage::{KvStore, StorageError};
pub use sync::{RejectedOperation, SyncReport};
