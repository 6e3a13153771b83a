//! Storage layer
//!
//! Durable client storage owned by the sync engine.
//!
//! ## Layout
//!
//! One SQLite table holds a JSON document per key:
//!
//! - `pendingOperations` - the outbox
//! - `deletedEntityRegistry` - locally deleted entity ids
//! - `cache_meta` - paging metadata of the last server listing
//! - `cache_page_<n>_<fingerprint>` - cached pages
//! - `temp_id_seq` - last temporary id handed out
//!
//! The store enforces a byte quota so the cache has to degrade instead of
//! growing without bound.

pub mod error;
pub mod kv;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, CORRUPT_SUFFIX};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
