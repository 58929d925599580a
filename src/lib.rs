// lib.rs - IP marketplace dashboard core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod evidence;
mod in_flight;
pub mod manifest;
pub mod model;
pub mod pagination;
pub mod preview;
pub mod resources;
pub mod submission;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use capabilities::{
    ChainError, ContentStore, CounterEvidence, DisputeClient, EvidenceWrite, HttpBackend,
    HttpContentStore, HttpError, RaiseDispute, RetryPolicy, ValidatedUrl,
};
pub use config::{ConfigError, DashboardConfig};
pub use evidence::{EvidenceBundle, EvidenceCollector, EvidenceError, FileId, RawFile};
pub use pagination::{
    Navigation, PageSource, PageView, PaginationController, PaginationError, PaginationState,
    RefreshHandle,
};
pub use preview::{PreviewConfig, PreviewError, PreviewGenerator};
pub use resources::{AssetFilters, DisputeFilters, HttpPageSource, TransactionFilters};
pub use submission::{
    ResetPolicy, SubmissionError, SubmissionPipeline, SubmissionResult, SubmissionView,
    UploadProgress,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    NotFound,
    RateLimited,
    Upstream,
    Serialization,
    Deserialization,
    Configuration,
    UploadFailed,
    OnChain,
    ImageProcessing,
    ImageTooLarge,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Upstream => "UPSTREAM_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::UploadFailed => "UPLOAD_FAILED",
            Self::OnChain => "ON_CHAIN_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::RateLimited
            | Self::Upstream
            | Self::UploadFailed
            | Self::InvalidState => ErrorSeverity::Transient,

            Self::Serialization | Self::Configuration | Self::Internal => ErrorSeverity::Fatal,

            Self::Validation
            | Self::NotFound
            | Self::Deserialization
            | Self::OnChain
            | Self::ImageProcessing
            | Self::ImageTooLarge
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Upstream | Self::UploadFailed
        )
    }
}

/// Error record handed to the rendering shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and try again.".into(),
            ErrorKind::Upstream => "The service is having trouble. Please try again shortly.".into(),
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Configuration => {
                "The dashboard is misconfigured. Please contact support.".into()
            }
            ErrorKind::UploadFailed => match self.context.get("target") {
                Some(target) => format!("Could not upload {target}. Please try again."),
                None => "Could not upload your evidence. Please try again.".into(),
            },
            ErrorKind::OnChain => capabilities::friendly_message(&self.message),
            ErrorKind::ImageProcessing => {
                "Unable to preview this image. It will still be uploaded.".into()
            }
            ErrorKind::ImageTooLarge => "The image is too large to preview.".into(),
            ErrorKind::InvalidState => "Please wait for the current action to finish.".into(),
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Upstream,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

// ============================================================================
// Conversions
// ============================================================================

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let internal = e.to_string();
        let app = match &e {
            HttpError::InvalidUrl { .. } => AppError::new(ErrorKind::Configuration, internal.clone()),
            HttpError::InvalidRequest { reason } => AppError::new(ErrorKind::Validation, reason.clone()),
            HttpError::SerializationError { message } => {
                AppError::new(ErrorKind::Serialization, message.clone())
            }
            HttpError::ConnectionError { message } => AppError::new(ErrorKind::Network, message.clone()),
            HttpError::Timeout { timeout_ms } => {
                AppError::new(ErrorKind::Timeout, format!("timed out after {timeout_ms}ms"))
            }
            HttpError::HttpStatus { status, message, .. } => {
                AppError::from_http_status(*status, Some(message.as_bytes()))
            }
            HttpError::InvalidResponse { reason } => {
                AppError::new(ErrorKind::Deserialization, reason.clone())
            }
        };
        app.with_internal(internal)
    }
}

impl From<PaginationError> for AppError {
    fn from(e: PaginationError) -> Self {
        match e {
            PaginationError::Fetch { cursor, source } => {
                AppError::from(source).with_context("cursor", cursor.to_string())
            }
            PaginationError::InvalidPageSize(_) => AppError::new(ErrorKind::Configuration, e.to_string()),
        }
    }
}

impl From<EvidenceError> for AppError {
    fn from(e: EvidenceError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<PreviewError> for AppError {
    fn from(e: PreviewError) -> Self {
        let kind = match &e {
            PreviewError::ImageTooLarge { .. } | PreviewError::InputTooLarge { .. } => {
                ErrorKind::ImageTooLarge
            }
            _ => ErrorKind::ImageProcessing,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<ChainError> for AppError {
    fn from(e: ChainError) -> Self {
        AppError::new(ErrorKind::OnChain, e.message())
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

impl From<SubmissionError> for AppError {
    fn from(e: SubmissionError) -> Self {
        match e {
            SubmissionError::Validation(inner) => inner.into(),
            SubmissionError::AlreadyInFlight => AppError::new(ErrorKind::InvalidState, e.to_string()),
            SubmissionError::Upload { ref target, ref source } => {
                let severity = if source.is_retryable() {
                    ErrorSeverity::Transient
                } else {
                    ErrorSeverity::Permanent
                };
                AppError::new(ErrorKind::UploadFailed, e.to_string())
                    .with_severity(severity)
                    .with_context("target", target.to_string())
                    .with_internal(source.to_string())
            }
            SubmissionError::Manifest(message) => AppError::new(ErrorKind::Serialization, message),
            SubmissionError::OnChain { message } => AppError::new(ErrorKind::OnChain, message),
        }
    }
}
