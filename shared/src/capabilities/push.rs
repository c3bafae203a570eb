use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::model::{TripId, UserId};

/// Address of a push channel: `user-<id>` or `travel-<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ChannelName {
    User(UserId),
    Travel(TripId),
}

impl ChannelName {
    pub const USER_PREFIX: &'static str = "user-";
    pub const TRAVEL_PREFIX: &'static str = "travel-";

    #[must_use]
    pub fn user(id: &UserId) -> Self {
        Self::User(id.clone())
    }

    #[must_use]
    pub fn travel(id: &TripId) -> Self {
        Self::Travel(id.clone())
    }

    pub fn parse(raw: &str) -> Result<Self, PushError> {
        if let Some(id) = raw.strip_prefix(Self::USER_PREFIX).filter(|s| !s.is_empty()) {
            return Ok(Self::User(UserId::new(id)));
        }
        if let Some(id) = raw.strip_prefix(Self::TRAVEL_PREFIX).filter(|s| !s.is_empty()) {
            return Ok(Self::Travel(TripId::new(id)));
        }
        Err(PushError::InvalidChannel {
            channel: raw.to_string(),
        })
    }

    #[must_use]
    pub fn trip_id(&self) -> Option<&TripId> {
        match self {
            Self::Travel(id) => Some(id),
            Self::User(_) => None,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "{}{id}", Self::USER_PREFIX),
            Self::Travel(id) => write!(f, "{}{id}", Self::TRAVEL_PREFIX),
        }
    }
}

impl From<ChannelName> for String {
    fn from(channel: ChannelName) -> Self {
        channel.to_string()
    }
}

impl TryFrom<String> for ChannelName {
    type Error = PushError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// An inbound message from the push substrate. `payload` carries a full
/// trip snapshot for trip events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub channel: ChannelName,
    pub name: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushError {
    #[error("invalid channel name '{channel}'")]
    InvalidChannel { channel: String },

    #[error("push transport not connected")]
    NotConnected,

    #[error("failed to join {channel}: {reason}")]
    JoinFailed { channel: String, reason: String },

    #[error("network error: {message}")]
    Network { message: String },
}

impl PushError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Network { .. } | Self::JoinFailed { .. })
    }
}

pub type PushResult = Result<(), PushError>;

/// Subscribe/leave primitives of the push substrate (socket client owned by
/// the host shell). Inbound events are handed to the core separately.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    async fn join(&self, channel: &ChannelName) -> PushResult;
    async fn leave(&self, channel: &ChannelName) -> PushResult;
}

#[derive(Debug, Default)]
struct SubscriptionState {
    /// Channels the app wants to be in.
    desired: BTreeSet<ChannelName>,
    /// Channels confirmed joined on the current connection.
    joined: BTreeSet<ChannelName>,
    connected: bool,
}

/// Tracks channel membership across reconnects so joins stay idempotent.
pub struct PushSubscriptions<P: PushTransport> {
    transport: Arc<P>,
    state: Mutex<SubscriptionState>,
}

impl<P: PushTransport> PushSubscriptions<P> {
    pub fn new(transport: Arc<P>) -> Self {
        Self {
            transport,
            state: Mutex::new(SubscriptionState {
                connected: true,
                ..SubscriptionState::default()
            }),
        }
    }

    /// Joins `channel` unless already joined on this connection.
    pub async fn join(&self, channel: ChannelName) -> PushResult {
        let should_join = {
            let mut state = self.state.lock().await;
            state.desired.insert(channel.clone());
            state.connected && !state.joined.contains(&channel)
        };

        if !should_join {
            debug!(channel = %channel, "join skipped, already joined or offline");
            return Ok(());
        }

        self.transport.join(&channel).await?;
        self.state.lock().await.joined.insert(channel.clone());
        info!(channel = %channel, "joined push channel");
        Ok(())
    }

    pub async fn leave(&self, channel: &ChannelName) -> PushResult {
        let was_joined = {
            let mut state = self.state.lock().await;
            state.desired.remove(channel);
            state.joined.remove(channel)
        };

        if was_joined {
            self.transport.leave(channel).await?;
            info!(channel = %channel, "left push channel");
        }
        Ok(())
    }

    /// Memberships are lost server-side on disconnect; remember what to rejoin.
    pub async fn on_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.joined.clear();
    }

    /// Rejoins every desired channel. Safe to call repeatedly.
    pub async fn on_connected(&self) -> PushResult {
        let pending: Vec<ChannelName> = {
            let mut state = self.state.lock().await;
            state.connected = true;
            state.desired.difference(&state.joined).cloned().collect()
        };

        let mut first_error = None;
        for channel in pending {
            match self.transport.join(&channel).await {
                Ok(()) => {
                    self.state.lock().await.joined.insert(channel.clone());
                    debug!(channel = %channel, "rejoined push channel");
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "rejoin failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub async fn is_joined(&self, channel: &ChannelName) -> bool {
        self.state.lock().await.joined.contains(channel)
    }

    pub async fn joined_channels(&self) -> Vec<ChannelName> {
        self.state.lock().await.joined.iter().cloned().collect()
    }
}
