//! Upload tokens and raw transfers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::error::RequestError;
use crate::fetch::FetchResponse;
use crate::session::SessionManager;
use crate::transport::{Request, Response};

/// Kind of media being uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadType {
    Video,
    FactualQuestionPool,
}

impl UploadType {
    fn path_segment(self) -> &'static str {
        match self {
            UploadType::Video => "video",
            UploadType::FactualQuestionPool => "factual_question_pool",
        }
    }

    /// File extension used when the caller does not supply one.
    pub fn default_extension(self) -> &'static str {
        "mov"
    }
}

impl fmt::Display for UploadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Temporary storage credentials for a single upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[serde(default)]
    pub expiration: Option<String>,
    #[serde(rename = "S3Bucket")]
    pub bucket: String,
    #[serde(rename = "S3Key")]
    pub key: String,
}

impl FetchResponse for UploadCredentials {
    type Object = UploadCredentials;

    fn objects(&self) -> Vec<&UploadCredentials> {
        vec![self]
    }
}

impl SessionManager {
    /// Request credentials for uploading a file of the given type.
    #[instrument(skip(self))]
    pub async fn request_upload_token(
        &self,
        upload_type: UploadType,
        extension: Option<&str>,
    ) -> Result<UploadCredentials, RequestError> {
        let extension = extension.unwrap_or(upload_type.default_extension());
        let request = Request::post(format!("api/uploads/v1/token/{}", upload_type))
            .parameters(json!({ "filename": format!("upload.{}", extension) }))
            .authenticated();
        self.api.fetch::<UploadCredentials>(&request).await
    }

    /// Upload raw bytes to an API path.
    pub async fn upload(
        &self,
        path: &str,
        data: &[u8],
        authenticated: bool,
        timeout: Option<Duration>,
    ) -> Result<Response, RequestError> {
        self.api
            .transport()
            .upload(path, data, 200..300, authenticated, timeout)
            .await
    }

    /// Download from another host, optionally with the session token.
    pub async fn download(
        &self,
        host: &str,
        path: &str,
        authenticated: bool,
    ) -> Result<Response, RequestError> {
        self.api.transport().download(host, path, authenticated).await
    }
}
