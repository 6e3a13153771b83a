//! Catalog server client
//!
//! The engine talks to the authoritative REST backend through the
//! [`CatalogApi`] trait so tests can substitute an in-process fake.

pub mod error;
#[cfg(test)]
pub(crate) mod fake;
pub mod http;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::{Entity, EntityId, ListPage, ListQuery};

pub use error::{ApiError, ApiResult, RetryClass};
pub use http::HttpCatalogClient;

/// Operations the engine needs from the catalog server
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Fetch one page of the collection
    async fn list(&self, query: &ListQuery) -> ApiResult<ListPage>;

    /// Create an entity; the server assigns its id
    async fn create(&self, fields: &Map<String, Value>) -> ApiResult<Entity>;

    /// Apply a partial update and return the stored entity
    async fn update(&self, id: &EntityId, fields: &Map<String, Value>) -> ApiResult<Entity>;

    /// Delete an entity; a missing entity yields [`ApiError::NotFound`]
    async fn delete(&self, id: &EntityId) -> ApiResult<()>;

    /// Cheap request used to decide whether the server is reachable
    async fn probe(&self) -> ApiResult<()>;
}
