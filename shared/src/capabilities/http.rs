use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::DEFAULT_REQUEST_TIMEOUT;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_REQUEST_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_TIMEOUT_MS: u64 = 120_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }
        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(&url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(&url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            url: parsed.to_string(),
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path plus query, e.g. `/travels/7?page=0`.
    pub fn path_and_query(&self) -> String {
        match Url::parse(&self.url) {
            Ok(parsed) => match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            },
            Err(_) => self.url.clone(),
        }
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let mut end = 100;
            while !url.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &url[..end])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces (case-insensitive) a header.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        Self::validate_header_name(&name)?;
        Self::validate_header_value(&name, &value)?;

        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::InvalidHeader {
                name,
                reason: format!("more than {MAX_HEADERS_COUNT} headers"),
            });
        }
        self.headers.push((name, value));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() {
            return Err(HttpError::InvalidHeader {
                name: String::new(),
                reason: "header name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect::<String>() + "...",
                reason: format!(
                    "header name exceeds maximum length of {MAX_HEADER_NAME_LENGTH} bytes"
                ),
            });
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!("invalid character '{c}' in header name"),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {MAX_HEADER_VALUE_LENGTH} bytes"
                ),
            });
        }

        if value.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value contains invalid characters (CR, LF, or NULL)".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
        }
    }

    pub fn has_request_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Patch)
    }
}

/// What the session layer may do with a request that comes back 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RequestKind {
    /// Eligible for refresh-and-replay.
    #[default]
    Standard,
    Login,
    Register,
    Refresh,
}

impl RequestKind {
    pub fn is_auth_endpoint(self) -> bool {
        !matches!(self, RequestKind::Standard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    method: HttpMethod,
    url: ValidatedUrl,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
    timeout_ms: u64,
    request_id: String,
    kind: RequestKind,
    retried: bool,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: ValidatedUrl) -> Self {
        Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: u64::try_from(DEFAULT_REQUEST_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            request_id: uuid::Uuid::new_v4().to_string(),
            kind: RequestKind::Standard,
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Get, ValidatedUrl::new(url)?))
    }

    pub fn post(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Post, ValidatedUrl::new(url)?))
    }

    pub fn patch(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self::new(HttpMethod::Patch, ValidatedUrl::new(url)?))
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HttpError> {
        if !self.method.has_request_body() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }

        let body = serde_json::to_vec(value).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;

        if body.len() > MAX_REQUEST_BODY_SIZE {
            return Err(HttpError::InvalidRequest {
                reason: format!(
                    "request body of {} bytes exceeds maximum of {MAX_REQUEST_BODY_SIZE} bytes",
                    body.len()
                ),
            });
        }

        self.headers.insert("Content-Type", "application/json")?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, HttpError> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return Err(HttpError::InvalidRequest {
                reason: "timeout cannot be zero".to_string(),
            });
        }
        if ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout exceeds maximum of {MAX_TIMEOUT_MS}ms"),
            });
        }
        self.timeout_ms = ms;
        Ok(self)
    }

    #[must_use]
    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the bearer credential, replacing any previous one.
    pub fn set_bearer(&mut self, token: &str) -> Result<(), HttpError> {
        self.headers.insert("Authorization", format!("Bearer {token}"))
    }

    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        self.headers.insert(name, value)
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &ValidatedUrl {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// The bearer token this request carries, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
    },

    #[error("request cancelled")]
    Cancelled { request_id: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } | HttpError::ConnectionError { .. } => true,
            HttpError::HttpStatus { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.status() == Some(401)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: Vec<u8>, request_id: String) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
        }
    }

    pub fn json_body<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        let mut headers = HttpHeaders::new();
        headers.insert("Content-Type", "application/json").ok();
        Self::new(status, headers, body, uuid::Uuid::new_v4().to_string())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.status == 401
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {e}"),
            request_id: self.request_id.clone(),
        })
    }

    /// Converts a non-2xx response into `HttpError::HttpStatus`.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.is_success() {
            return Ok(self);
        }
        let message = extract_error_message(&self.body)
            .unwrap_or_else(|| format!("HTTP error: {}", self.status));
        Err(HttpError::HttpStatus {
            status: self.status,
            message,
            request_id: self.request_id,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Pulls the human-readable message out of a backend error body.
pub fn extract_error_message(body: &[u8]) -> Option<String> {
    let parsed: ApiErrorResponse = serde_json::from_slice(body).ok()?;
    parsed
        .message
        .or(parsed.error)
        .filter(|m| !m.trim().is_empty())
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Request/response substrate supplied by the host shell. Implementations
/// return every HTTP status as `Ok`; `Err` is reserved for failures where no
/// response was received.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> HttpResult;
}
