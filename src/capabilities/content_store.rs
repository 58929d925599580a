use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::http::{HttpBackend, HttpError, ValidatedUrl};
use crate::model::Cid;

pub const JSON_CONTENT_TYPE: &str = "application/json";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// One blob headed for the content-addressed store.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadBlob {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl UploadBlob {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn json(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::new(file_name, JSON_CONTENT_TYPE, bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Payloads can be large; never dump them into logs.
impl std::fmt::Debug for UploadBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBlob")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Content-addressed storage: upload bytes, get back a content identifier.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn upload(&self, blob: UploadBlob) -> Result<Cid, HttpError>;

    /// Public URL the stored content can be fetched from.
    fn content_url(&self, cid: &Cid) -> String;
}

#[async_trait]
impl<S: ContentStore + ?Sized> ContentStore for Arc<S> {
    async fn upload(&self, blob: UploadBlob) -> Result<Cid, HttpError> {
        (**self).upload(blob).await
    }

    fn content_url(&self, cid: &Cid) -> String {
        (**self).content_url(cid)
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    cid: Option<String>,
}

/// Uploads through the backend's pinning endpoint as a multipart form with a
/// single `file` field; the endpoint answers `{"cid": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpContentStore {
    http: HttpBackend,
    upload_url: ValidatedUrl,
    gateway_base: ValidatedUrl,
}

impl HttpContentStore {
    pub fn new(http: HttpBackend, upload_url: ValidatedUrl, gateway_base: ValidatedUrl) -> Self {
        Self {
            http,
            upload_url,
            gateway_base,
        }
    }

    fn form(blob: &UploadBlob) -> Result<reqwest::multipart::Form, HttpError> {
        let part = reqwest::multipart::Part::bytes(blob.bytes.to_vec()).file_name(blob.file_name.clone());
        let part = match part.mime_str(&blob.content_type) {
            Ok(part) => part,
            Err(_) => {
                debug!(content_type = %blob.content_type, "unparseable content type, sending as octet-stream");
                reqwest::multipart::Part::bytes(blob.bytes.to_vec())
                    .file_name(blob.file_name.clone())
                    .mime_str(FALLBACK_CONTENT_TYPE)
                    .map_err(|e| HttpError::InvalidRequest {
                        reason: e.to_string(),
                    })?
            }
        };
        Ok(reqwest::multipart::Form::new().part("file", part))
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    #[instrument(skip(self, blob), fields(file = %blob.file_name, len = blob.len()))]
    async fn upload(&self, blob: UploadBlob) -> Result<Cid, HttpError> {
        // Multipart forms are single-use, rebuild per attempt.
        let response = self
            .http
            .send(|| {
                Ok(self
                    .http
                    .client()
                    .post(self.upload_url.as_str())
                    .multipart(Self::form(&blob)?))
            })
            .await?;

        let body: UploadResponse = HttpBackend::read_json(response).await?;
        match body.cid.filter(|cid| !cid.trim().is_empty()) {
            Some(cid) => {
                debug!(%cid, "blob stored");
                Ok(Cid::new(cid))
            }
            None => Err(HttpError::InvalidResponse {
                reason: "upload response carried no cid".to_string(),
            }),
        }
    }

    fn content_url(&self, cid: &Cid) -> String {
        format!("{}/{}", self.gateway_base.as_str().trim_end_matches('/'), cid)
    }
}
