//! Error types for the session core.

use thiserror::Error;

/// Errors produced by the transport and fetch layers.
///
/// Transport failures are classified into this taxonomy at the transport
/// boundary; nothing above it sees raw `reqwest` errors.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The base host and path did not form a valid URL.
    #[error("invalid URL for request: {0}")]
    InvalidUrl(String),

    /// The server answered with a status outside the acceptable range.
    #[error("bad status: {0}")]
    BadStatus(u16),

    /// The body could not be decoded into the expected response type.
    #[error("decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Request parameters could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The body was not valid in the expected text encoding.
    #[error("encoding error: {0}")]
    StringEncoding(String),

    /// The server answered 404.
    #[error("request not found")]
    NotFound,

    /// Writing the result locally failed.
    #[error("write error on request: {0}")]
    Write(String),

    /// The body was empty where one was required.
    #[error("empty response")]
    EmptyResponse,

    /// No request was made, or no response arrived.
    #[error("no request was made")]
    NoResponse,

    /// The response did not have the expected shape.
    #[error("unexpected response from request")]
    Unexpected,

    /// Anything else (connection failures, timeouts, TLS).
    #[error("unknown request error: {0}")]
    Unknown(String),
}

impl RequestError {
    /// HTTP status carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RequestError::BadStatus(code) => Some(*code),
            RequestError::NotFound => Some(404),
            _ => None,
        }
    }

    /// Whether the server explicitly rejected the request (4xx).
    pub fn is_client_rejection(&self) -> bool {
        matches!(self.status_code(), Some(400..=499))
    }

    /// Classify a `reqwest` failure.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return RequestError::InvalidUrl(
                err.url().map(|u| u.to_string()).unwrap_or_else(|| err.to_string()),
            );
        }
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return RequestError::NotFound;
            }
            return RequestError::BadStatus(status.as_u16());
        }
        if err.is_decode() {
            return RequestError::StringEncoding(err.to_string());
        }
        RequestError::Unknown(err.to_string())
    }
}

/// Errors from the local object cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error reading or writing the backing file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A write transaction failed and nothing was committed.
    #[error("failed to write to cache: {0}")]
    Write(String),
}

/// Errors from the settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// IO error reading or writing the settings file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings file could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by session operations that do not collapse to `bool`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Request failed.
    #[error("request failed: {0}")]
    Request(#[from] RequestError),

    /// The verification code was rejected or could not be checked.
    #[error("phone verification failed")]
    Verification,

    /// An operation required a signed-in user.
    #[error("no current user")]
    NoCurrentUser,
}
