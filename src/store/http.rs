use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Collection, DataStore, Filter, StoreError, StoreResult};
use crate::config::StoreConfig;

/// Код ошибки, которым хранилище сообщает о нарушении уникальности.
const RECORD_NOT_UNIQUE: &str = "RECORD_NOT_UNIQUE";

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    message: String,
    extensions: Option<ApiErrorExtensions>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorExtensions {
    code: Option<String>,
}

/// REST-клиент headless CMS: `/items/{collection}[/{id}]`.
#[derive(Clone)]
pub struct HttpDataStore {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpDataStore {
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            http,
        })
    }

    fn items_url(&self, collection: Collection) -> String {
        format!("{}/items/{}", self.base_url, collection.as_str())
    }

    fn item_url(&self, collection: Collection, id: Uuid) -> String {
        format!("{}/items/{}/{}", self.base_url, collection.as_str(), id)
    }

    /// Отправляет запрос и разворачивает `{ "data": ... }`.
    /// 204 и пустое тело дают `Value::Null`.
    async fn send(&self, collection: Collection, request: RequestBuilder) -> StoreResult<Value> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();

        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            let body = response.bytes().await?;
            if body.is_empty() {
                return Ok(Value::Null);
            }
            let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| StoreError::Decode {
                collection: collection.as_str(),
                message: e.to_string(),
            })?;
            return Ok(envelope.data);
        }

        let body = response.text().await.unwrap_or_default();
        Err(api_error(collection, status, &body))
    }
}

fn api_error(collection: Collection, status: StatusCode, body: &str) -> StoreError {
    let first = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.errors.into_iter().next());

    let (code, message) = match first {
        Some(item) => (
            item.extensions
                .and_then(|x| x.code)
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            item.message,
        ),
        None => ("UNKNOWN".to_string(), body.chars().take(200).collect()),
    };

    if code == RECORD_NOT_UNIQUE {
        return StoreError::Unique { collection: collection.as_str() };
    }

    warn!(
        collection = collection.as_str(),
        status = status.as_u16(),
        code = %code,
        "data store request rejected"
    );
    StoreError::Api {
        status: status.as_u16(),
        code,
        message,
    }
}

#[async_trait]
impl DataStore for HttpDataStore {
    async fn get(&self, collection: Collection, id: Uuid, fields: &[&str]) -> StoreResult<Option<Value>> {
        let mut request = self.http.get(self.item_url(collection, id));
        if !fields.is_empty() {
            request = request.query(&[("fields", fields.join(","))]);
        }

        match self.send(collection, request).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(StoreError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, collection: Collection, filter: &Filter, sort: &[&str]) -> StoreResult<Vec<Value>> {
        let mut params = vec![("limit", "-1".to_string())];
        if !filter.is_empty() {
            params.push(("filter", filter.to_json().to_string()));
        }
        if !sort.is_empty() {
            params.push(("sort", sort.join(",")));
        }
        debug!(collection = collection.as_str(), ?params, "listing records");

        let request = self.http.get(self.items_url(collection)).query(&params);
        match self.send(collection, request).await? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(StoreError::Decode {
                collection: collection.as_str(),
                message: format!("expected an array, got {other}"),
            }),
        }
    }

    async fn singleton(&self, collection: Collection) -> StoreResult<Value> {
        let request = self.http.get(self.items_url(collection));
        self.send(collection, request).await
    }

    async fn create(&self, collection: Collection, body: Value) -> StoreResult<Value> {
        let request = self.http.post(self.items_url(collection)).json(&body);
        self.send(collection, request).await
    }

    async fn patch(&self, collection: Collection, id: Uuid, body: Value) -> StoreResult<Value> {
        let request = self.http.patch(self.item_url(collection, id)).json(&body);
        self.send(collection, request).await
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> StoreResult<()> {
        let request = self.http.delete(self.item_url(collection, id));
        self.send(collection, request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn client(server: &MockServer) -> HttpDataStore {
        HttpDataStore::from_config(&StoreConfig {
            url: server.uri(),
            token: "store-token".to_string(),
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn get_unwraps_data_and_maps_404_to_none() {
        let server = MockServer::start().await;
        let seat = Uuid::new_v4();
        let missing = Uuid::new_v4();

        Mock::given(method("GET"))
            .and(path(format!("/items/seats/{seat}")))
            .and(header("authorization", "Bearer store-token"))
            .and(query_param("fields", "id,status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"id": seat, "status": "empty"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/items/seats/{missing}")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errors": [{"message": "Not found", "extensions": {"code": "NOT_FOUND"}}]
            })))
            .mount(&server)
            .await;

        let store = client(&server);
        let found = store.get(Collection::Seats, seat, &["id", "status"]).await.unwrap();
        assert_eq!(found.unwrap()["status"], "empty");
        assert!(store.get(Collection::Seats, missing, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_sends_filter_and_sort() {
        let server = MockServer::start().await;
        let filter = Filter::new().eq("status", "pending");

        Mock::given(method("GET"))
            .and(path("/items/bookings"))
            .and(query_param("filter", filter.to_json().to_string()))
            .and(query_param("sort", "-created_at"))
            .and(query_param("limit", "-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": Uuid::new_v4()}, {"id": Uuid::new_v4()}]
            })))
            .mount(&server)
            .await;

        let rows = client(&server)
            .list(Collection::Bookings, &filter, &["-created_at"])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn unique_violation_is_recognised() {
        let server = MockServer::start().await;
        let body = json!({"booking_item_id": Uuid::new_v4()});

        Mock::given(method("POST"))
            .and(path("/items/checkins"))
            .and(body_json(&body))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errors": [{
                    "message": "Value for field \"booking_item_id\" has to be unique.",
                    "extensions": {"code": "RECORD_NOT_UNIQUE"}
                }]
            })))
            .mount(&server)
            .await;

        let err = client(&server).create(Collection::Checkins, body).await.unwrap_err();
        assert!(matches!(err, StoreError::Unique { collection: "checkins" }));
    }

    #[tokio::test]
    async fn server_errors_keep_status_and_code() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();

        Mock::given(method("PATCH"))
            .and(path(format!("/items/payments/{id}")))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "errors": [{"message": "Service unavailable", "extensions": {"code": "SERVICE_UNAVAILABLE"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/items/bookings/{id}")))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let store = client(&server);
        let err = store
            .patch(Collection::Payments, id, json!({"status": "processing"}))
            .await
            .unwrap_err();
        match err {
            StoreError::Api { status, code, .. } => {
                assert_eq!(status, 503);
                assert_eq!(code, "SERVICE_UNAVAILABLE");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        store.delete(Collection::Bookings, id).await.unwrap();
    }
}
