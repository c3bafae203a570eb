use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(TripId);
typed_id!(UserId);

// --- Roles ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Driver,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Driver => "driver",
        }
    }

    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Requester => Self::Driver,
            Self::Driver => Self::Requester,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Trip status state machine ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Request,
    Accept,
    Start,
    End,
    Cancelled,
}

impl TripStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Start => "START",
            Self::End => "END",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REQUEST" => Some(Self::Request),
            "ACCEPT" => Some(Self::Accept),
            "START" => Some(Self::Start),
            "END" => Some(Self::End),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Cancelled)
    }

    /// Position along the forward path; `None` for `Cancelled`.
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Request => Some(0),
            Self::Accept => Some(1),
            Self::Start => Some(2),
            Self::End => Some(3),
            Self::Cancelled => None,
        }
    }

    #[must_use]
    pub fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Request => &[Self::Accept, Self::Cancelled],
            Self::Accept => &[Self::Start, Self::Cancelled],
            Self::Start => &[Self::End, Self::Cancelled],
            Self::End | Self::Cancelled => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// True when moving from `self` to `to` goes against the transition graph.
    #[must_use]
    pub fn is_regression_to(self, to: Self) -> bool {
        if self == to {
            return false;
        }
        if self.is_terminal() {
            return true;
        }
        match (self.rank(), to.rank()) {
            (Some(from), Some(to)) => to < from,
            _ => false,
        }
    }

    pub fn validate_transition(self, to: Self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::FromTerminalStatus { status: self });
        }
        if self == to {
            return Err(TransitionError::SameStatus);
        }
        if !self.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { from: self, to });
        }
        Ok(())
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Cannot transition to the same status")]
    SameStatus,
    #[error("Cannot transition from terminal status: {status}")]
    FromTerminalStatus { status: TripStatus },
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TripStatus, to: TripStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Paid)
    }
}

// --- Trip snapshot ---

/// Read-mirror of a trip as delivered by the backend. Every snapshot is a
/// full representation, never a patch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: TripId,
    pub status: TripStatus,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub requester_id: Option<UserId>,
    #[serde(default)]
    pub driver_id: Option<UserId>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub commission_amount: Option<f64>,
    #[serde(default)]
    pub commission_paid: bool,
    #[serde(default)]
    pub programed_to: Option<String>,
}

impl Trip {
    #[must_use]
    pub fn new(id: impl Into<String>, status: TripStatus) -> Self {
        Self {
            id: TripId::new(id),
            status,
            payment_status: PaymentStatus::Pending,
            from: None,
            to: None,
            requester_id: None,
            driver_id: None,
            price: None,
            commission_amount: None,
            commission_paid: false,
            programed_to: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: TripStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn awaiting_payment(&self) -> bool {
        self.status == TripStatus::End && !self.payment_status.is_settled()
    }
}

impl crate::reconcile::Identified for Trip {
    fn id(&self) -> &str {
        self.id.as_str()
    }
}

// --- Credential ---

/// Access/refresh token pair. Persisted as one JSON blob; never logged.
#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(serialize_with = "expose_for_storage")]
    access_token: SecretString,
    #[serde(serialize_with = "expose_for_storage")]
    refresh_token: SecretString,
}

fn expose_for_storage<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            refresh_token: SecretString::new(refresh_token.into()),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        self.refresh_token.expose_secret()
    }

    /// Both tokens present and non-blank.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.access_token().trim().is_empty() && !self.refresh_token().trim().is_empty()
    }

    /// Short, non-reversible tag of the access token for log correlation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.access_token().as_bytes());
        hex::encode(&hash.as_bytes()[..4])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.access_token() == other.access_token() && self.refresh_token() == other.refresh_token()
    }
}
