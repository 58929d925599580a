use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_ERROR_BODY_LENGTH: usize = 512;

/// Endpoint URL checked once at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url)?;

        let scheme = parsed.scheme().to_lowercase();
        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Appends `segment` as a path below this URL, keeping any base path.
    pub fn join(&self, segment: &str) -> Result<Self, HttpError> {
        let base = self.url.trim_end_matches('/');
        let segment = segment.trim_start_matches('/');
        Self::new(format!("{}/{}", base, segment))
    }

    fn validate(url: &str) -> Result<Url, HttpError> {
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(parsed)
    }

    fn truncate_url(url: &str) -> String {
        let mut end = url.len().min(100);
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        if end == url.len() {
            url.to_string()
        } else {
            format!("{}...", &url[..end])
        }
    }
}

impl std::fmt::Display for ValidatedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Retry behaviour applied at the HTTP boundary. The default never retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }

    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::none()
        }
    }

    pub fn with_backoff(mut self, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.initial_backoff_ms = initial_backoff_ms;
        self.max_backoff_ms = max_backoff_ms.max(initial_backoff_ms);
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    pub fn should_retry(&self, error: &HttpError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Full-jitter exponential backoff for the given 1-based retry.
    pub fn backoff(&self, retry: u32) -> Duration {
        use rand::Rng;

        let exp = retry.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jittered = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(base / 2..=base)
        };
        Duration::from_millis(jittered)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("connection failed: {message}")]
    ConnectionError { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } => true,
            HttpError::ConnectionError { .. } => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout { timeout_ms: 0 }
        } else if e.is_decode() {
            HttpError::InvalidResponse {
                reason: e.to_string(),
            }
        } else if e.is_builder() {
            HttpError::InvalidRequest {
                reason: e.to_string(),
            }
        } else {
            HttpError::ConnectionError {
                message: e.to_string(),
            }
        }
    }
}

/// Shared reqwest client plus the retry policy every call goes through.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    retry: RetryPolicy,
    timeout_ms: u64,
}

impl HttpBackend {
    pub fn new(timeout_ms: u64, retry: RetryPolicy) -> Result<Self, HttpError> {
        if timeout_ms == 0 || timeout_ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout must be in 1..={}ms", MAX_TIMEOUT_MS),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| HttpError::ConnectionError {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            retry,
            timeout_ms,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// POST a JSON body and decode a JSON response.
    pub async fn post_json<B, R>(&self, url: &ValidatedUrl, body: &B) -> Result<R, HttpError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;

        let response = self
            .send(|| {
                Ok(self
                    .client
                    .post(url.as_str())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload.clone()))
            })
            .await?;

        Self::read_json(response).await
    }

    /// Sends the request built by `build`, rebuilding it for every retry.
    /// A build failure is returned as is and never retried.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response, HttpError>
    where
        F: Fn() -> Result<reqwest::RequestBuilder, HttpError>,
    {
        let mut attempt = 0;

        loop {
            match self.send_once(build()?).await {
                Ok(response) => return Ok(response),
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    attempt += 1;
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        error = %e,
                        retry = attempt,
                        max_retries = self.retry.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying request"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn read_json<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, HttpError> {
        let body = response.bytes().await.map_err(HttpError::from)?;
        serde_json::from_slice(&body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {}", e),
        })
    }

    async fn send_once(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, HttpError> {
        let response = request.send().await.map_err(|e| match HttpError::from(e) {
            HttpError::Timeout { .. } => HttpError::Timeout {
                timeout_ms: self.timeout_ms,
            },
            other => other,
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            debug!(status, "request succeeded");
            return Ok(response);
        }

        let mut message = response
            .text()
            .await
            .unwrap_or_else(|_| format!("status {}", status));
        if message.len() > MAX_ERROR_BODY_LENGTH {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }

        Err(HttpError::HttpStatus {
            status,
            message,
            retryable: self.retry.is_retryable_status(status),
        })
    }
}
