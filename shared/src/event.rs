use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{Role, Trip, TripId, TripStatus};
use crate::UnixTimeMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Push,
    Poll,
    /// Local write issued by this device, not yet confirmed.
    Local,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Poll => "poll",
            Self::Local => "local",
        })
    }
}

/// One observation of a trip's authoritative status. Consumed immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub travel_id: TripId,
    pub reported_status: TripStatus,
    pub source: SnapshotSource,
    pub received_at: UnixTimeMs,
}

impl SyncEvent {
    #[must_use]
    pub fn from_snapshot(trip: &Trip, source: SnapshotSource) -> Self {
        Self {
            travel_id: trip.id.clone(),
            reported_status: trip.status,
            source,
            received_at: UnixTimeMs::now(),
        }
    }
}

/// Side effects the presentation layer reacts to (modals, navigation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEffect {
    DriverAssigned,
    TripStarted,
    PaymentRequired,
    TripCompleted,
    TripCancelled { by_counterpart: bool },
    /// Server state disagrees with an optimistic local write.
    OptimisticRejected { expected: TripStatus, actual: TripStatus },
}

impl LifecycleEffect {
    /// Effects implied by observing `current` after `previous`, as seen by `viewer`.
    #[must_use]
    pub fn for_change(
        viewer: Role,
        previous: Option<TripStatus>,
        trip: &Trip,
        source: SnapshotSource,
    ) -> Vec<Self> {
        let current = trip.status;
        if previous == Some(current) {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match current {
            TripStatus::Accept if viewer == Role::Requester => effects.push(Self::DriverAssigned),
            TripStatus::Start => effects.push(Self::TripStarted),
            TripStatus::End => {
                effects.push(Self::TripCompleted);
                if viewer == Role::Requester && trip.awaiting_payment() {
                    effects.push(Self::PaymentRequired);
                }
            }
            TripStatus::Cancelled => effects.push(Self::TripCancelled {
                by_counterpart: source != SnapshotSource::Local,
            }),
            TripStatus::Request | TripStatus::Accept => {}
        }
        effects
    }
}

/// Broadcast to subscribers whenever the cached status of a trip changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleUpdate {
    pub trip_id: TripId,
    pub previous: Option<TripStatus>,
    pub current: TripStatus,
    pub source: SnapshotSource,
    pub effects: Vec<LifecycleEffect>,
}
