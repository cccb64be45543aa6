//! Request, decode and persist pipeline.
//!
//! [`ApiClient::fetch`] sends a [`Request`] and decodes the body into a typed
//! [`FetchResponse`]. [`ApiClient::fetch_and_persist`] additionally upserts
//! every object the response yields into the [`ObjectCache`] in a single write
//! transaction.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument, warn};

use crate::cache::{ObjectCache, Upsert};
use crate::error::RequestError;
use crate::transport::{Request, Response, Transport};

/// A typed API response that yields zero or more domain objects.
pub trait FetchResponse: DeserializeOwned + Send + Sync {
    type Object;

    /// Objects carried by this response.
    fn objects(&self) -> Vec<&Self::Object>;

    /// Decode a response body. Dates are handled per field, see [`crate::dates`].
    fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Client combining the transport with the local object cache.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<Transport>,
    cache: Arc<ObjectCache>,
}

impl ApiClient {
    pub fn new(transport: Arc<Transport>, cache: Arc<ObjectCache>) -> Self {
        Self { transport, cache }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Send a request without decoding the body.
    pub async fn request(&self, request: &Request) -> Result<Response, RequestError> {
        self.transport.send(request).await
    }

    /// Send a request and decode the body as plain JSON.
    pub async fn decoded<T: DeserializeOwned>(&self, request: &Request) -> Result<T, RequestError> {
        let response = self.request(request).await?;
        decode_body(&request.path, &response.data, |data| serde_json::from_slice(data))
    }

    /// Send a request and decode the body into `T`.
    #[instrument(skip(self, request), fields(path = %request.path))]
    pub async fn fetch<T: FetchResponse>(&self, request: &Request) -> Result<T, RequestError> {
        let response = self.request(request).await.map_err(|e| {
            warn!(error = %e, "error fetching");
            e
        })?;
        decode_body(&request.path, &response.data, T::decode)
    }

    /// Fetch `T` and upsert every object it yields into the cache.
    ///
    /// A failed cache write is logged and does not fail the fetch.
    #[instrument(skip(self, request), fields(path = %request.path))]
    pub async fn fetch_and_persist<T>(&self, request: &Request) -> Result<T, RequestError>
    where
        T: FetchResponse,
        T::Object: Upsert + Sync,
    {
        let response = self.fetch::<T>(request).await?;

        {
            let objects = response.objects();
            let result = self
                .cache
                .write(|txn| {
                    for object in &objects {
                        txn.upsert(*object);
                    }
                    Ok(objects.len())
                })
                .await;

            match result {
                Ok(count) => debug!(count, "persisted fetched objects"),
                Err(e) => warn!(error = %e, "could not write fetched objects to cache"),
            }
        }

        Ok(response)
    }
}

fn decode_body<T>(
    path: &str,
    data: &[u8],
    decode: impl FnOnce(&[u8]) -> serde_json::Result<T>,
) -> Result<T, RequestError> {
    decode(data).map_err(|e| {
        let body = String::from_utf8_lossy(data);
        error!(path = %path, error = %e, body = %body, "failed to decode response");
        RequestError::Decode(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::types::{AvatarsFetchResponse, User, UserAvatar, UserFetchResponse, UsersFetchResponse};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer, cache: Arc<ObjectCache>) -> ApiClient {
        let transport = Arc::new(Transport::new(Environment::custom(server.uri())));
        ApiClient::new(transport, cache)
    }

    #[tokio::test]
    async fn test_fetch_decodes_without_persisting() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/v1/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": { "id": "u1", "username": "kd", "phone_verified": true }
            })))
            .mount(&server)
            .await;

        let cache = ObjectCache::new();
        let api = api_for(&server, Arc::clone(&cache));

        let response: UserFetchResponse = api.fetch(&Request::get("api/users/v1/u1")).await.unwrap();
        assert_eq!(response.user.profile.username.as_deref(), Some("kd"));
        assert!(cache.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/v1/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"unexpected": true}"#))
            .mount(&server)
            .await;

        let api = api_for(&server, ObjectCache::new());

        let result = api
            .fetch::<UserFetchResponse>(&Request::get("api/users/v1/u1"))
            .await;
        assert!(matches!(result, Err(RequestError::Decode(_))));
    }

    #[tokio::test]
    async fn test_fetch_propagates_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/v1/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = api_for(&server, ObjectCache::new());

        let result = api
            .fetch::<UserFetchResponse>(&Request::get("api/users/v1/missing"))
            .await;
        assert!(matches!(result, Err(RequestError::NotFound)));
    }

    #[tokio::test]
    async fn test_fetch_authenticated_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/v1/u1"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": { "id": "u1" }
            })))
            .mount(&server)
            .await;

        let api = api_for(&server, ObjectCache::new());
        api.transport().set_token(Some("secret".to_string())).await;

        let unauthenticated = api
            .fetch::<UserFetchResponse>(&Request::get("api/users/v1/u1"))
            .await;
        assert!(unauthenticated.is_err());

        let authenticated = api
            .fetch::<UserFetchResponse>(&Request::get("api/users/v1/u1").authenticated())
            .await;
        assert!(authenticated.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_and_persist_upserts_objects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [
                    { "id": "u1", "username": "one" },
                    { "id": "u2", "username": "two", "bio": "second" }
                ]
            })))
            .mount(&server)
            .await;

        let cache = ObjectCache::new();
        let api = api_for(&server, Arc::clone(&cache));

        let response: UsersFetchResponse = api
            .fetch_and_persist(&Request::get("api/users/v1"))
            .await
            .unwrap();
        assert_eq!(response.users.len(), 2);

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.count::<User>(), 2);
        assert_eq!(
            snapshot.get::<User>("u2").unwrap().bio.as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn test_fetch_and_persist_nested_objects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/avatars/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "avatars": [{
                    "id": "a1",
                    "name": "Hooper",
                    "created_at": "2024-08-23T10:15:30.000Z",
                    "user_avatars": [{ "id": "ua1", "user_id": "u1", "avatar_id": "a1" }]
                }]
            })))
            .mount(&server)
            .await;

        let cache = ObjectCache::new();
        let api = api_for(&server, Arc::clone(&cache));

        let _: AvatarsFetchResponse = api
            .fetch_and_persist(&Request::get("api/avatars/v1"))
            .await
            .unwrap();

        let snapshot = cache.snapshot().await;
        let link = snapshot.get::<UserAvatar>("ua1").unwrap();
        assert_eq!(link.avatar(&snapshot).unwrap().id, "a1");
    }

    #[tokio::test]
    async fn test_cache_write_failure_returns_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/v1/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user": { "id": "u1", "username": "kd" }
            })))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("cache");
        let cache = ObjectCache::open(dir.join("objects.json")).await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        let api = api_for(&server, Arc::clone(&cache));

        let response: UserFetchResponse = api
            .fetch_and_persist(&Request::get("api/users/v1/u1"))
            .await
            .unwrap();
        assert_eq!(response.user.profile.id, "u1");
        assert_eq!(cache.count::<User>().await, 0);
    }
}
