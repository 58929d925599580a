use thiserror::Error;
use tracing::debug;

use crate::capabilities::content_store::HttpContentStore;
use crate::capabilities::http::{
    HttpBackend, HttpError, RetryPolicy, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
use crate::pagination::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::preview::{PreviewConfig, PreviewGenerator};

pub const ENV_API_URL: &str = "IPDASH_API_URL";
pub const ENV_CONTENT_STORE_URL: &str = "IPDASH_CONTENT_STORE_URL";
pub const ENV_GATEWAY_URL: &str = "IPDASH_GATEWAY_URL";
pub const ENV_PAGE_SIZE: &str = "IPDASH_PAGE_SIZE";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "IPDASH_REQUEST_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "IPDASH_MAX_RETRIES";

const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: HttpError,
    },

    #[error("config validation failed: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DashboardConfig {
    pub api_base_url: String,
    pub content_store_url: String,
    pub gateway_base_url: String,
    pub page_size: u32,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub preview: PreviewConfig,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3001/api".to_string(),
            content_store_url: "http://localhost:3001/api/ipfs/upload".to_string(),
            gateway_base_url: "https://ipfs.io/ipfs".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetryPolicy::none(),
            preview: PreviewConfig::default(),
        }
    }
}

impl DashboardConfig {
    /// Defaults overridden by `IPDASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get(ENV_API_URL) {
            config.api_base_url = url;
        }
        if let Some(url) = get(ENV_CONTENT_STORE_URL) {
            config.content_store_url = url;
        }
        if let Some(url) = get(ENV_GATEWAY_URL) {
            config.gateway_base_url = url;
        }
        if let Some(value) = get(ENV_PAGE_SIZE) {
            config.page_size = parse_env(ENV_PAGE_SIZE, value)?;
        }
        if let Some(value) = get(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout_ms = parse_env(ENV_REQUEST_TIMEOUT_MS, value)?;
        }
        if let Some(value) = get(ENV_MAX_RETRIES) {
            let max_retries: u32 = parse_env(ENV_MAX_RETRIES, value)?;
            config.retry = RetryPolicy::exponential(max_retries);
        }

        config.validate()?;
        debug!(
            api = %config.api_base_url,
            page_size = config.page_size,
            max_retries = config.retry.max_retries,
            "dashboard config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_url()?;
        self.content_store_endpoint()?;
        self.gateway_url()?;

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Validation(format!(
                "page_size must be in 1..={}",
                MAX_PAGE_SIZE
            )));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::Validation(format!(
                "request_timeout_ms must be in 1..={}",
                MAX_TIMEOUT_MS
            )));
        }
        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Validation(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Validation(
                "initial_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if self.preview.max_edge == 0 || self.preview.max_concurrent_jobs == 0 {
            return Err(ConfigError::Validation(
                "preview max_edge and max_concurrent_jobs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn api_url(&self) -> Result<ValidatedUrl, ConfigError> {
        parse_url("api_base_url", &self.api_base_url)
    }

    pub fn content_store_endpoint(&self) -> Result<ValidatedUrl, ConfigError> {
        parse_url("content_store_url", &self.content_store_url)
    }

    pub fn gateway_url(&self) -> Result<ValidatedUrl, ConfigError> {
        parse_url("gateway_base_url", &self.gateway_base_url)
    }

    pub fn http_backend(&self) -> Result<HttpBackend, ConfigError> {
        HttpBackend::new(self.request_timeout_ms, self.retry.clone())
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    pub fn content_store(&self) -> Result<HttpContentStore, ConfigError> {
        Ok(HttpContentStore::new(
            self.http_backend()?,
            self.content_store_endpoint()?,
            self.gateway_url()?,
        ))
    }

    pub fn preview_generator(&self) -> PreviewGenerator {
        PreviewGenerator::new(self.preview.clone())
    }
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        reason: e.to_string(),
        value,
    })
}

fn parse_url(field: &'static str, url: &str) -> Result<ValidatedUrl, ConfigError> {
    ValidatedUrl::new(url).map_err(|source| ConfigError::InvalidUrl { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid_and_never_retries() {
        let config = DashboardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.page_size, 12);
    }

    #[test]
    fn test_env_overrides() {
        let config = DashboardConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://api.example.com/v3"),
            (ENV_PAGE_SIZE, "25"),
            (ENV_MAX_RETRIES, "3"),
            (ENV_REQUEST_TIMEOUT_MS, " 5000 "),
        ]))
        .unwrap();

        assert_eq!(config.api_url().unwrap().host(), "api.example.com");
        assert_eq!(config.page_size, 25);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_blank_env_keeps_default() {
        let config = DashboardConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "  ")])).unwrap();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_unparseable_env() {
        let err = DashboardConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "twelve")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: ENV_PAGE_SIZE, .. }));
    }

    #[test]
    fn test_out_of_range_values() {
        let err = DashboardConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "500")])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let config = DashboardConfig {
            request_timeout_ms: 0,
            ..DashboardConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_url_names_field() {
        let err = DashboardConfig::from_lookup(lookup(&[(ENV_GATEWAY_URL, "ftp://gw")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { field: "gateway_base_url", .. }));
    }
}
