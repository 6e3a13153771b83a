//! REST client for the catalog server
//!
//! Endpoints, relative to `{server_url}/{collection}`:
//!
//! - `GET ?page&pageSize&<filters>` list a page
//! - `POST` create
//! - `PUT /{id}` update
//! - `DELETE /{id}` delete

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};
use tracing::debug;

use super::error::{ApiError, ApiResult};
use super::CatalogApi;
use crate::config::Config;
use crate::models::{Entity, EntityId, ListPage, ListQuery};

/// Default timeout for regular requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`CatalogApi`]
#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    client: Client,
    base_url: String,
    collection: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("stockroom/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into().trim_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> ApiResult<Self> {
        Self::new(&config.server_url, &config.collection)
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, self.collection)
    }

    fn entity_url(&self, id: &EntityId) -> String {
        format!("{}/{}", self.collection_url(), id)
    }

    /// Send a request and turn non-success statuses into errors
    async fn execute(&self, req: RequestBuilder) -> ApiResult<Response> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else if e.is_connect() {
                ApiError::Unreachable(e.to_string())
            } else {
                ApiError::Transport(e)
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        debug!(status = status.as_u16(), "Request failed: {}", text);

        match status {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(text)),
            status => Err(ApiError::status(status.as_u16(), text)),
        }
    }

    async fn read_entity(resp: Response) -> ApiResult<Option<Entity>> {
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Accept both the paged envelope and a bare array of entities
fn parse_list(body: &str, query: &ListQuery) -> ApiResult<ListPage> {
    let value: Value = serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))?;

    if value.is_array() {
        let items: Vec<Entity> =
            serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))?;
        return Ok(ListPage {
            total_items: items.len() as u64,
            items,
            current_page: query.page,
            total_pages: 1,
        });
    }

    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl CatalogApi for HttpCatalogClient {
    async fn list(&self, query: &ListQuery) -> ApiResult<ListPage> {
        let mut params = vec![
            ("page".to_string(), query.page.to_string()),
            ("pageSize".to_string(), query.page_size.to_string()),
        ];
        params.extend(query.filters.iter().map(|(k, v)| (k.clone(), v.clone())));

        let resp = self
            .execute(self.client.get(self.collection_url()).query(&params))
            .await?;
        let body = resp.text().await?;
        parse_list(&body, query)
    }

    async fn create(&self, fields: &Map<String, Value>) -> ApiResult<Entity> {
        let resp = self
            .execute(self.client.post(self.collection_url()).json(fields))
            .await?;
        Self::read_entity(resp)
            .await?
            .ok_or_else(|| ApiError::Decode("create returned an empty body".to_string()))
    }

    async fn update(&self, id: &EntityId, fields: &Map<String, Value>) -> ApiResult<Entity> {
        let resp = self
            .execute(self.client.put(self.entity_url(id)).json(fields))
            .await?;
        // Some servers answer 204 without echoing the entity
        Ok(Self::read_entity(resp)
            .await?
            .unwrap_or_else(|| Entity::new(id.clone(), fields.clone())))
    }

    async fn delete(&self, id: &EntityId) -> ApiResult<()> {
        self.execute(self.client.delete(self.entity_url(id)))
            .await?;
        Ok(())
    }

    async fn probe(&self) -> ApiResult<()> {
        self.execute(
            self.client
                .get(self.collection_url())
                .query(&[("page", "1"), ("pageSize", "1")]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HttpCatalogClient {
        HttpCatalogClient::new(format!("{}/api/", server.uri()), "products").unwrap()
    }

    #[tokio::test]
    async fn test_list_paged_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .and(query_param("page", "2"))
            .and(query_param("pageSize", "10"))
            .and(query_param("category", "kitchen"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 11, "name": "Mug"}],
                "currentPage": 2,
                "totalPages": 4,
                "totalItems": 31
            })))
            .mount(&server)
            .await;

        let query = ListQuery::new(2, 10).with_filter("category", "kitchen");
        let page = client(&server).await.list(&query).await.unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, EntityId::from(11));
        assert_eq!(page.total_pages, 4);
        assert_eq!(page.total_items, 31);
    }

    #[tokio::test]
    async fn test_list_bare_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": "2"}])),
            )
            .mount(&server)
            .await;

        let page = client(&server).await.list(&ListQuery::default()).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_items, 2);
        assert_eq!(page.current_page, 1);
    }

    #[tokio::test]
    async fn test_create_posts_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/products"))
            .and(body_json(json!({"name": "Lamp"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42, "name": "Lamp"})))
            .mount(&server)
            .await;

        let fields = json!({"name": "Lamp"}).as_object().cloned().unwrap();
        let entity = client(&server).await.create(&fields).await.unwrap();
        assert_eq!(entity.id, EntityId::from(42));
    }

    #[tokio::test]
    async fn test_update_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/products/7"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let fields = json!({"price": 3}).as_object().cloned().unwrap();
        let entity = client(&server)
            .await
            .update(&EntityId::from(7), &fields)
            .await
            .unwrap();
        assert_eq!(entity.id, EntityId::from(7));
        assert_eq!(entity.field("price"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/products/9"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such product"))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .delete(&EntityId::from(9))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_validation_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/products"))
            .respond_with(ResponseTemplate::new(422).set_body_string("price must be positive"))
            .mount(&server)
            .await;

        let err = client(&server).await.create(&Map::new()).await.unwrap_err();
        assert_eq!(err.status_code(), Some(422));
        assert_eq!(err.retry_class(), crate::client::RetryClass::Rejected);
        assert!(err.to_string().contains("price must be positive"));
    }

    #[tokio::test]
    async fn test_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .and(query_param("pageSize", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;

        assert!(client(&server).await.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).await.probe().await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));
    }
}
