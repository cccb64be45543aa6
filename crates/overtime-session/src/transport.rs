//! HTTP transport for the Overtime API.
//!
//! Builds URLs from the active environment, attaches the bearer token on
//! request, encodes parameters and classifies every failure into
//! [`RequestError`].

use std::collections::HashSet;
use std::ops::Range;
use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{DEFAULT_REQUEST_TIMEOUT, Environment};
use crate::error::RequestError;

/// Status codes for which an empty body is a valid response.
const EMPTY_RESPONSE_CODES: [u16; 2] = [204, 205];

/// How request parameters are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestEncoding {
    /// JSON body for non-GET requests, query string for GET.
    #[default]
    Json,
    /// URL-encoded query string or form body.
    Form,
}

/// Description of a single API request.
#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    pub method: Method,
    pub parameters: Option<Map<String, Value>>,
    pub valid_status: Range<u16>,
    pub encoding: RequestEncoding,
    pub authenticated: bool,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create an unauthenticated request accepting any 2xx status.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            parameters: None,
            valid_status: 200..300,
            encoding: RequestEncoding::Json,
            authenticated: false,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Set the request parameters. Non-object values are ignored.
    pub fn parameters(mut self, parameters: Value) -> Self {
        if let Value::Object(map) = parameters {
            self.parameters = Some(map);
        }
        self
    }

    /// Attach the session's bearer token.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    pub fn valid_status(mut self, range: Range<u16>) -> Self {
        self.valid_status = range;
        self
    }

    pub fn encoding(mut self, encoding: RequestEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Timing information for a completed request.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMetrics {
    pub task_interval: Duration,
}

/// A successful response with its raw body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub data: Vec<u8>,
    pub metrics: ResponseMetrics,
}

/// HTTP transport bound to an environment and an optional bearer token.
pub struct Transport {
    http: Client,
    environment: RwLock<Environment>,
    token: RwLock<Option<String>>,
    default_timeout: Duration,
    empty_response_codes: HashSet<u16>,
    empty_request_methods: Vec<Method>,
}

impl Transport {
    /// Create a transport for the given environment.
    pub fn new(environment: Environment) -> Self {
        Self::with_timeout(environment, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a transport with a custom default timeout.
    pub fn with_timeout(environment: Environment, default_timeout: Duration) -> Self {
        let http = Client::builder()
            .connect_timeout(default_timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            environment: RwLock::new(environment),
            token: RwLock::new(None),
            default_timeout,
            empty_response_codes: EMPTY_RESPONSE_CODES.into_iter().collect(),
            empty_request_methods: vec![Method::HEAD],
        }
    }

    /// Current environment.
    pub async fn environment(&self) -> Environment {
        self.environment.read().await.clone()
    }

    /// Switch environment. Affects requests issued afterwards.
    pub async fn set_environment(&self, environment: Environment) {
        debug!(environment = %environment, "switching environment");
        *self.environment.write().await = environment;
    }

    /// Current bearer token.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Replace the bearer token.
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// Resolve a relative path against the environment host.
    pub async fn url_for(&self, path: &str) -> Result<Url, RequestError> {
        if path.starts_with('/') {
            warn!(path = %path, "extra leading / in path");
        }
        let raw = format!("{}{}", self.environment.read().await.host_url(), path);
        Url::parse(&raw).map_err(|_| RequestError::InvalidUrl(raw))
    }

    /// Send a request and return the raw response.
    pub async fn send(&self, request: &Request) -> Result<Response, RequestError> {
        let url = self.url_for(&request.path).await?;

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(request.timeout.unwrap_or(self.default_timeout));

        if request.authenticated {
            builder = self.authorize(builder).await;
        }

        if let Some(parameters) = &request.parameters {
            builder = encode_parameters(builder, &request.method, request.encoding, parameters);
        }

        debug!(method = %request.method, path = %request.path, "requesting");
        self.execute(builder, &request.method, &request.path, &request.valid_status)
            .await
    }

    /// Upload raw bytes with a `Content-MD5` checksum.
    pub async fn upload(
        &self,
        path: &str,
        data: &[u8],
        valid_status: Range<u16>,
        authenticated: bool,
        timeout: Option<Duration>,
    ) -> Result<Response, RequestError> {
        let url = self.url_for(path).await?;

        let mut builder = self
            .http
            .post(url)
            .timeout(timeout.unwrap_or(self.default_timeout))
            .header("Content-Type", "application/octet-stream")
            .header("Content-MD5", content_md5(data))
            .body(data.to_vec());

        if authenticated {
            builder = self.authorize(builder).await;
        }

        debug!(path = %path, size = data.len(), "uploading");
        self.execute(builder, &Method::POST, path, &valid_status)
            .await
    }

    /// Download from an absolute host rather than the environment host.
    pub async fn download(
        &self,
        host: &str,
        path: &str,
        authenticated: bool,
    ) -> Result<Response, RequestError> {
        let raw = format!("{}/{}", host.trim_end_matches('/'), path);
        let url = Url::parse(&raw).map_err(|_| RequestError::InvalidUrl(raw.clone()))?;

        let mut builder = self.http.get(url).timeout(self.default_timeout);
        if authenticated {
            builder = self.authorize(builder).await;
        }

        debug!(url = %raw, "downloading");
        self.execute(builder, &Method::GET, path, &(200..300)).await
    }

    async fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token().await {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn execute(
        &self,
        builder: RequestBuilder,
        method: &Method,
        path: &str,
        valid_status: &Range<u16>,
    ) -> Result<Response, RequestError> {
        let start = Instant::now();

        let response = builder.send().await.map_err(|e| {
            warn!(method = %method, path = %path, error = %e, "request failed");
            RequestError::from_reqwest(e)
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(RequestError::from_reqwest)?;

        let elapsed = start.elapsed();
        debug!(
            method = %method,
            path = %path,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "request completed"
        );

        let data = self.serialize_response(method, status, valid_status, body.to_vec())?;

        Ok(Response {
            status,
            data,
            metrics: ResponseMetrics {
                task_interval: elapsed,
            },
        })
    }

    /// Validate the status and body of a raw response.
    fn serialize_response(
        &self,
        method: &Method,
        status: u16,
        valid_status: &Range<u16>,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, RequestError> {
        if !valid_status.contains(&status) {
            return Err(match status {
                404 => RequestError::NotFound,
                _ => RequestError::BadStatus(status),
            });
        }

        if data.is_empty() && !self.empty_response_allowed(method, status) {
            return Err(RequestError::EmptyResponse);
        }

        Ok(data)
    }

    fn empty_response_allowed(&self, method: &Method, status: u16) -> bool {
        self.empty_request_methods.contains(method) || self.empty_response_codes.contains(&status)
    }
}

/// Hex MD5 digest sent as `Content-MD5`.
pub fn content_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn encode_parameters(
    builder: RequestBuilder,
    method: &Method,
    encoding: RequestEncoding,
    parameters: &Map<String, Value>,
) -> RequestBuilder {
    if encoding == RequestEncoding::Json && *method != Method::GET {
        return builder.json(parameters);
    }

    let pairs = query_pairs(parameters);
    if matches!(*method, Method::GET | Method::HEAD | Method::DELETE) {
        builder.query(&pairs)
    } else {
        builder.form(&pairs)
    }
}

/// Flatten parameters into URL-encoded pairs.
///
/// Booleans encode as literal `true`/`false`, arrays as `key[]`, nested
/// objects as `key[sub]`. Nulls are dropped.
pub(crate) fn query_pairs(parameters: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in parameters {
        push_pairs(&mut pairs, key.clone(), value);
    }
    pairs
}

fn push_pairs(pairs: &mut Vec<(String, String)>, key: String, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => pairs.push((key, b.to_string())),
        Value::Number(n) => pairs.push((key, n.to_string())),
        Value::String(s) => pairs.push((key, s.clone())),
        Value::Array(items) => {
            for item in items {
                push_pairs(pairs, format!("{}[]", key), item);
            }
        }
        Value::Object(map) => {
            for (sub, item) in map {
                push_pairs(pairs, format!("{}[{}]", key, sub), item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn transport_for(server: &MockServer) -> Transport {
        Transport::new(Environment::custom(server.uri()))
    }

    #[test]
    fn test_content_md5() {
        assert_eq!(content_md5(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_query_pairs() {
        let params = json!({
            "flag": true,
            "count": 3,
            "name": "ot",
            "skip": null,
            "tags": ["a", "b"],
            "filter": {"team": "x"}
        });
        let Value::Object(map) = params else {
            unreachable!()
        };

        let mut pairs = query_pairs(&map);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("count".to_string(), "3".to_string()),
                ("filter[team]".to_string(), "x".to_string()),
                ("flag".to_string(), "true".to_string()),
                ("name".to_string(), "ot".to_string()),
                ("tags[]".to_string(), "a".to_string()),
                ("tags[]".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_url_for_joins_host_and_path() {
        let transport = Transport::new(Environment::Staging);
        let url = transport.url_for("api/users/v1/abc").await.unwrap();
        assert_eq!(url.as_str(), "https://stg-api.itsovertime.com/api/users/v1/abc");
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let transport = Transport::new(Environment::Custom("not a host/".to_string()));
        let result = transport.send(&Request::get("api/x")).await;
        assert!(matches!(result, Err(RequestError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_bearer_token_attached_when_authenticated() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/secure"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;
        transport.set_token(Some("test-token".to_string())).await;

        let response = transport
            .send(&Request::get("api/secure").authenticated())
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        // Without opting in, the header is not sent and the mock doesn't match.
        let result = transport.send(&Request::get("api/secure")).await;
        assert!(matches!(result, Err(RequestError::NotFound)));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/created"))
            .respond_with(ResponseTemplate::new(201).set_body_string("{}"))
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;

        let result = transport.send(&Request::get("api/missing")).await;
        assert!(matches!(result, Err(RequestError::NotFound)));

        let result = transport.send(&Request::get("api/broken")).await;
        assert!(matches!(result, Err(RequestError::BadStatus(500))));

        let result = transport
            .send(&Request::get("api/created").valid_status(200..201))
            .await;
        assert!(matches!(result, Err(RequestError::BadStatus(201))));
    }

    #[tokio::test]
    async fn test_empty_bodies() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/no-content"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/api/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;

        let response = transport
            .send(&Request::delete("api/no-content"))
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert!(response.data.is_empty());

        let result = transport.send(&Request::get("api/empty")).await;
        assert!(matches!(result, Err(RequestError::EmptyResponse)));

        let response = transport
            .send(&Request::new(Method::HEAD, "api/empty"))
            .await
            .unwrap();
        assert!(response.data.is_empty());
    }

    #[tokio::test]
    async fn test_get_parameters_go_in_query() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/users/v1/u1"))
            .and(query_param("nocache", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;
        let response = transport
            .send(&Request::get("api/users/v1/u1").parameters(json!({"nocache": true})))
            .await
            .unwrap();
        assert_eq!(response.data, b"{}");
    }

    #[tokio::test]
    async fn test_post_parameters_go_in_json_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/auth/device_id"))
            .and(body_json(json!({"device_id": "abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"t"}"#))
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;
        let response = transport
            .send(&Request::post("api/auth/device_id").parameters(json!({"device_id": "abc"})))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_form_encoding() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/form"))
            .and(header("Content-Type", "application/x-www-form-urlencoded"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;
        let response = transport
            .send(
                &Request::post("api/form")
                    .parameters(json!({"a": "b"}))
                    .encoding(RequestEncoding::Form),
            )
            .await
            .unwrap();
        assert_eq!(response.data, b"ok");
    }

    #[tokio::test]
    async fn test_upload_sends_checksum() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/uploads/v1/blob"))
            .and(header("Content-Type", "application/octet-stream"))
            .and(header("Content-MD5", "5d41402abc4b2a76b9719d911017c592"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = transport_for(&mock_server).await;
        let response = transport
            .upload("api/uploads/v1/blob", b"hello", 200..300, false, None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_download_from_other_host() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/files/video.mov"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(Environment::Production);
        let response = transport
            .download(&mock_server.uri(), "files/video.mov", false)
            .await
            .unwrap();
        assert_eq!(response.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_connection_failure_is_unknown() {
        let transport = Transport::new(Environment::custom("http://127.0.0.1:9"));
        let result = transport.send(&Request::get("api/x")).await;
        assert!(matches!(result, Err(RequestError::Unknown(_))));
    }
}
