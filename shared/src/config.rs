use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::{
    DEFAULT_ITEMS_PER_PAGE, DEFAULT_ORIGIN, DEFAULT_POLL_INTERVAL, DEFAULT_REFRESH_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_TRIP_CACHE_CAPACITY, MAX_ITEMS_PER_PAGE, MAX_POLL_INTERVAL,
    MIN_POLL_INTERVAL,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("poll interval {ms}ms outside [{min}, {max}]ms")]
    PollIntervalOutOfRange { ms: u64, min: u64, max: u64 },
    #[error("items_per_page {value} exceeds maximum of {max}")]
    PageTooLarge { value: u32, max: u32 },
}

/// Shell-supplied settings for the core. Deserializable so the host app can
/// pass it as JSON.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Value of the origin marker header identifying the client type.
    pub origin: String,
    pub request_timeout_ms: u64,
    pub refresh_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub items_per_page: u32,
    pub trip_cache_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com".to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            request_timeout_ms: u64::try_from(DEFAULT_REQUEST_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            refresh_timeout_ms: u64::try_from(DEFAULT_REFRESH_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(u64::MAX),
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
            trip_cache_capacity: DEFAULT_TRIP_CACHE_CAPACITY,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "request_timeout_ms" });
        }
        if self.refresh_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "refresh_timeout_ms" });
        }
        if self.items_per_page == 0 {
            return Err(ConfigError::Zero { field: "items_per_page" });
        }
        if self.items_per_page > MAX_ITEMS_PER_PAGE {
            return Err(ConfigError::PageTooLarge {
                value: self.items_per_page,
                max: MAX_ITEMS_PER_PAGE,
            });
        }
        if self.trip_cache_capacity == 0 {
            return Err(ConfigError::Zero { field: "trip_cache_capacity" });
        }

        let min = u64::try_from(MIN_POLL_INTERVAL.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(MAX_POLL_INTERVAL.as_millis()).unwrap_or(u64::MAX);
        if !(min..=max).contains(&self.poll_interval_ms) {
            return Err(ConfigError::PollIntervalOutOfRange {
                ms: self.poll_interval_ms,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Joins an API path onto the base URL without doubling slashes.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
