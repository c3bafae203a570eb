// lib.rs - Shared client core for the transfer marketplace apps

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod api;
pub mod capabilities;
pub mod config;
pub mod event;
pub mod model;
pub mod poller;
pub mod reconcile;
pub mod session;
pub mod trip;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use config::{ClientConfig, ConfigError};
pub use event::{LifecycleEffect, LifecycleUpdate, SnapshotSource, SyncEvent};
pub use api::{ListResource, PageQuery, TripAction};
pub use model::{
    Credential, PaymentStatus, Role, TransitionError, Trip, TripId, TripStatus, UserId,
};
pub use poller::PollHandle;
pub use reconcile::{reconcile, FetchTicket, Identified, ListError, PagedList};
pub use session::{CredentialStore, SessionCoordinator, SessionError};
pub use trip::{
    CachedTrip, Provenance, SnapshotOutcome, TransitionOutcome, TripError, TripSynchronizer,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ITEMS_PER_PAGE: u32 = 10;
pub const MAX_ITEMS_PER_PAGE: u32 = 100;
pub const DEFAULT_TRIP_CACHE_CAPACITY: usize = 32;
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;
pub const CREDENTIAL_KEY: &str = "credential";
pub const ORIGIN_HEADER: &str = "X-Client-Origin";
pub const DEFAULT_ORIGIN: &str = "mobile";
pub const MAX_POLL_BACKOFF_MS: u64 = 30_000;
pub const POLL_JITTER_MAX_MS: u64 = 250;

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
    Authentication,
    SessionExpired,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    TripFinalized,
    InvalidTransition,
    Storage,
    Serialization,
    Push,
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
            Self::Authentication => "AUTH_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::TripFinalized => "TRIP_FINALIZED",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Push => "PUSH_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Storage | Self::Push => ErrorSeverity::Transient,

            Self::SessionExpired | Self::Serialization | Self::InvalidState | Self::Internal => {
                ErrorSeverity::Fatal
            }

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Conflict
            | Self::TripFinalized
            | Self::InvalidTransition
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Storage | Self::Push)
    }
}

/// Presentation-facing error envelope. Screens match on `kind`, never on
/// transport detail.
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

    /// True when the caller must route the user back to authentication.
    #[must_use]
    pub const fn requires_reauthentication(&self) -> bool {
        matches!(self.kind, ErrorKind::SessionExpired | ErrorKind::Authentication)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication | ErrorKind::SessionExpired => {
                "Your session has expired. Please sign in again.".into()
            }
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => "This trip is no longer available.".into(),
            ErrorKind::TripFinalized => "This trip has already been finalized.".into(),
            ErrorKind::InvalidTransition => {
                "This action is not available for the trip's current status.".into()
            }
            ErrorKind::Storage => "Unable to save data on this device.".into(),
            ErrorKind::Serialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Push => "Live updates are temporarily unavailable.".into(),
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(capabilities::http::extract_error_message)
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

pub type AppResult<T> = Result<T, AppError>;

impl From<capabilities::HttpError> for AppError {
    fn from(e: capabilities::HttpError) -> Self {
        use capabilities::HttpError;
        match &e {
            HttpError::Timeout { .. } => {
                AppError::new(ErrorKind::Timeout, "request timed out").with_internal(e.to_string())
            }
            HttpError::ConnectionError { .. } | HttpError::Cancelled { .. } => {
                AppError::new(ErrorKind::Network, "connection failed").with_internal(e.to_string())
            }
            HttpError::HttpStatus { status, message, .. } => {
                AppError::from_http_status(*status, None).with_internal(message.clone())
            }
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::InvalidRequest { .. } => {
                AppError::new(ErrorKind::Internal, "invalid request").with_internal(e.to_string())
            }
            HttpError::SerializationError { .. } | HttpError::InvalidResponse { .. } => {
                AppError::new(ErrorKind::Serialization, "invalid data").with_internal(e.to_string())
            }
        }
    }
}

impl From<capabilities::KvError> for AppError {
    fn from(e: capabilities::KvError) -> Self {
        AppError::new(ErrorKind::Storage, "storage failure").with_internal(e.to_string())
    }
}

impl From<capabilities::PushError> for AppError {
    fn from(e: capabilities::PushError) -> Self {
        AppError::new(ErrorKind::Push, "push channel failure").with_internal(e.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::SessionExpired => {
                AppError::new(ErrorKind::SessionExpired, "session expired")
            }
            SessionError::Http(inner) => inner.into(),
            SessionError::Storage(inner) => inner.into(),
            SessionError::Serialization(message) => {
                AppError::new(ErrorKind::Serialization, "invalid data").with_internal(message)
            }
        }
    }
}

impl From<TripError> for AppError {
    fn from(e: TripError) -> Self {
        match e {
            TripError::AlreadyFinalized { ref trip_id, status } => {
                AppError::new(ErrorKind::TripFinalized, e.to_string())
                    .with_context("trip_id", trip_id.as_str())
                    .with_context("status", status.as_str())
            }
            TripError::InvalidTransition { ref trip_id, .. } => {
                AppError::new(ErrorKind::InvalidTransition, e.to_string())
                    .with_context("trip_id", trip_id.as_str())
            }
            TripError::RoleNotPermitted { .. } => {
                AppError::new(ErrorKind::Authorization, e.to_string())
            }
            TripError::Conflict { ref trip_id, ref message } => {
                AppError::new(ErrorKind::Conflict, message.clone())
                    .with_context("trip_id", trip_id.as_str())
            }
            TripError::NotActive { ref trip_id } => {
                AppError::new(ErrorKind::InvalidState, e.to_string())
                    .with_context("trip_id", trip_id.as_str())
            }
            TripError::InvalidSnapshot { .. } => {
                AppError::new(ErrorKind::Serialization, "invalid trip data")
                    .with_internal(e.to_string())
            }
            TripError::Session(inner) => inner.into(),
            TripError::Push(inner) => inner.into(),
        }
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn is_after(self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorKind::SessionExpired.code(), "SESSION_EXPIRED");
        assert_eq!(ErrorKind::Conflict.code(), "CONFLICT");
        assert_eq!(ErrorKind::TripFinalized.code(), "TRIP_FINALIZED");
    }

    #[test]
    fn test_session_expired_is_fatal_and_requires_login() {
        let err: AppError = SessionError::SessionExpired.into();
        assert_eq!(err.kind, ErrorKind::SessionExpired);
        assert_eq!(err.severity, ErrorSeverity::Fatal);
        assert!(err.requires_reauthentication());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_trip_conflict_maps_to_unavailable_message() {
        let err: AppError = TripError::Conflict {
            trip_id: TripId::new("t-1"),
            message: "already accepted".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.user_facing_message(), "This trip is no longer available.");
        assert_eq!(err.context.get("trip_id").map(String::as_str), Some("t-1"));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err: AppError = capabilities::HttpError::Timeout {
            timeout_ms: 10_000,
            request_id: "r".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_http_status_reads_body_message() {
        let body = br#"{"message":"Travel already taken"}"#;
        let err = AppError::from_http_status(409, Some(body));
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.message, "Travel already taken");
        assert_eq!(err.context.get("http_status").map(String::as_str), Some("409"));
    }

    #[test]
    fn test_unix_time_helpers() {
        let a = UnixTimeMs(1_000);
        let b = UnixTimeMs(1_500);
        assert_eq!(b.elapsed_since(a), 500);
        assert_eq!(a.elapsed_since(b), 0);
        assert!(b.is_after(a));
    }
}
