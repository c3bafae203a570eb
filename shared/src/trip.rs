//! Trip lifecycle synchronization.
//!
//! Push events and poll results are both full snapshots and go through the
//! same [`TripSynchronizer::apply_snapshot`] entry point: the latest snapshot
//! for the active trip wins, snapshots for any other trip are dropped.
//! Role operations validate against the cached status before calling the
//! backend and record their target status as optimistic until a snapshot
//! confirms or contradicts it.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::api::{self, TripAction};
use crate::capabilities::{
    ChannelName, HttpError, HttpRequest, HttpTransport, KeyValueStore, PushError, PushEvent,
    PushSubscriptions, PushTransport,
};
use crate::event::{LifecycleEffect, LifecycleUpdate, SnapshotSource, SyncEvent};
use crate::model::{Role, TransitionError, Trip, TripId, TripStatus, UserId};
use crate::poller::{self, PollHandle};
use crate::session::{SessionCoordinator, SessionError};
use crate::{UnixTimeMs, LIFECYCLE_CHANNEL_CAPACITY};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TripError {
    #[error("trip {trip_id} already finalized ({status})")]
    AlreadyFinalized { trip_id: TripId, status: TripStatus },

    #[error("trip {trip_id} cannot move from {from} to {to}")]
    InvalidTransition {
        trip_id: TripId,
        from: TripStatus,
        to: TripStatus,
    },

    #[error("{role} cannot {action} a trip")]
    RoleNotPermitted { action: TripAction, role: Role },

    /// The backend refused the transition; the trip is no longer available
    /// in the state the caller assumed.
    #[error("trip {trip_id} is no longer available: {message}")]
    Conflict { trip_id: TripId, message: String },

    #[error("trip {trip_id} is not the active trip")]
    NotActive { trip_id: TripId },

    #[error("invalid trip snapshot: {reason}")]
    InvalidSnapshot { reason: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Push(#[from] PushError),
}

impl TripError {
    fn from_transition(trip_id: &TripId, error: TransitionError, to: TripStatus) -> Self {
        match error {
            TransitionError::FromTerminalStatus { status } => Self::AlreadyFinalized {
                trip_id: trip_id.clone(),
                status,
            },
            TransitionError::SameStatus => Self::InvalidTransition {
                trip_id: trip_id.clone(),
                from: to,
                to,
            },
            TransitionError::InvalidTransition { from, to } => Self::InvalidTransition {
                trip_id: trip_id.clone(),
                from,
                to,
            },
        }
    }
}

/// Statuses the backend returns when a transition is refused because the
/// trip moved on.
const CONFLICT_STATUSES: [u16; 5] = [400, 403, 404, 409, 422];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Written locally by a role operation, not yet confirmed by a snapshot.
    Optimistic {
        expected: TripStatus,
        since: UnixTimeMs,
    },
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTrip {
    pub trip: Trip,
    pub provenance: Provenance,
    pub last_source: SnapshotSource,
    pub updated_at: UnixTimeMs,
}

impl CachedTrip {
    fn confirmed(trip: Trip, source: SnapshotSource) -> Self {
        Self {
            trip,
            provenance: Provenance::Confirmed,
            last_source: source,
            updated_at: UnixTimeMs::now(),
        }
    }

    #[must_use]
    pub const fn is_optimistic(&self) -> bool {
        matches!(self.provenance, Provenance::Optimistic { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied {
        previous: Option<TripStatus>,
        current: TripStatus,
        /// The snapshot moved backwards along the transition graph.
        regressed: bool,
        /// Optimistic status the snapshot contradicted, if any.
        contradicted: Option<TripStatus>,
    },
    /// Snapshot for a trip other than the active one.
    Ignored,
}

impl SnapshotOutcome {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The backend accepted the request. Carries the optimistic trip, or the
    /// newer snapshot that arrived while the request was in flight.
    Applied(Trip),
    /// The request timed out. Local state is left for the next snapshot to
    /// settle.
    AwaitingConfirmation,
}

enum Delivery {
    Accepted,
    TimedOut,
}

struct SyncState {
    /// Pinned outside the LRU so trips fetched for role operations never
    /// evict it.
    active: Option<CachedTrip>,
    cache: LruCache<TripId, CachedTrip>,
}

impl SyncState {
    fn active_id(&self) -> Option<&TripId> {
        self.active.as_ref().map(|entry| &entry.trip.id)
    }

    fn is_active(&self, id: &TripId) -> bool {
        self.active_id() == Some(id)
    }

    fn peek(&self, id: &TripId) -> Option<&CachedTrip> {
        match &self.active {
            Some(entry) if entry.trip.id == *id => Some(entry),
            _ => self.cache.peek(id),
        }
    }

    fn get(&mut self, id: &TripId) -> Option<&CachedTrip> {
        if self.is_active(id) {
            return self.active.as_ref();
        }
        self.cache.get(id)
    }

    fn store(&mut self, entry: CachedTrip) {
        match &mut self.active {
            Some(active) if active.trip.id == entry.trip.id => *active = entry,
            _ => {
                self.cache.put(entry.trip.id.clone(), entry);
            }
        }
    }

    /// Pins `trip`'s entry, seeding it from `trip` only when nothing is
    /// cached for that id. Returns the trip it replaced.
    fn activate(&mut self, trip: Trip) -> Option<TripId> {
        if self.is_active(&trip.id) {
            return None;
        }
        let entry = self
            .cache
            .pop(&trip.id)
            .unwrap_or_else(|| CachedTrip::confirmed(trip, SnapshotSource::Poll));
        let previous = self.active.replace(entry)?;
        Some(self.unpin(previous))
    }

    fn deactivate(&mut self) -> Option<TripId> {
        let previous = self.active.take()?;
        Some(self.unpin(previous))
    }

    fn unpin(&mut self, entry: CachedTrip) -> TripId {
        let id = entry.trip.id.clone();
        self.cache.put(id.clone(), entry);
        id
    }
}

pub struct TripSynchronizer<T, S, P: PushTransport> {
    session: Arc<SessionCoordinator<T, S>>,
    viewer: Role,
    state: Mutex<SyncState>,
    updates: broadcast::Sender<LifecycleUpdate>,
    subscriptions: PushSubscriptions<P>,
}

impl<T, S, P> TripSynchronizer<T, S, P>
where
    T: HttpTransport,
    S: KeyValueStore,
    P: PushTransport,
{
    pub fn new(session: Arc<SessionCoordinator<T, S>>, push: Arc<P>, viewer: Role) -> Self {
        let capacity = NonZeroUsize::new(session.config().trip_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        let (updates, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            session,
            viewer,
            state: Mutex::new(SyncState {
                active: None,
                cache: LruCache::new(capacity),
            }),
            updates,
            subscriptions: PushSubscriptions::new(push),
        }
    }

    pub const fn viewer(&self) -> Role {
        self.viewer
    }

    pub fn session(&self) -> &Arc<SessionCoordinator<T, S>> {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleUpdate> {
        self.updates.subscribe()
    }

    pub fn subscriptions(&self) -> &PushSubscriptions<P> {
        &self.subscriptions
    }

    // ------------------------------------------------------------------------
    // Push channel membership
    // ------------------------------------------------------------------------

    /// Joins the account-wide channel for the rest of the session.
    #[instrument(skip(self))]
    pub async fn connect(&self, user_id: &UserId) -> Result<(), TripError> {
        self.subscriptions.join(ChannelName::user(user_id)).await?;
        Ok(())
    }

    pub async fn on_disconnected(&self) {
        self.subscriptions.on_disconnected().await;
    }

    /// Rejoins every channel the app still wants after a reconnect.
    pub async fn on_reconnect(&self) -> Result<(), TripError> {
        self.subscriptions.on_connected().await?;
        Ok(())
    }

    /// Makes `trip` the active trip and subscribes to its channel. `trip`
    /// only seeds the cache; an entry already cached for the same id, which
    /// may be newer than a list row, is kept. A failed join is retried on
    /// the next reconnect; polling covers the gap.
    #[instrument(skip(self, trip), fields(trip_id = %trip.id, status = %trip.status))]
    pub async fn activate(&self, trip: Trip) {
        let id = trip.id.clone();
        let replaced = self.state.lock().await.activate(trip);

        if let Some(previous) = replaced {
            self.leave_trip_channel(&previous).await;
        }
        if let Err(e) = self.subscriptions.join(ChannelName::travel(&id)).await {
            warn!(error = %e, "trip channel join failed, relying on polling");
        }
        info!("trip activated");
    }

    /// Forgets the active trip and leaves its channel. The per-user channel
    /// stays joined.
    pub async fn deactivate(&self) {
        let previous = self.state.lock().await.deactivate();
        if let Some(id) = previous {
            self.leave_trip_channel(&id).await;
            debug!(trip_id = %id, "trip deactivated");
        }
    }

    async fn leave_trip_channel(&self, id: &TripId) {
        if let Err(e) = self.subscriptions.leave(&ChannelName::travel(id)).await {
            warn!(trip_id = %id, error = %e, "failed to leave trip channel");
        }
    }

    pub async fn active_trip_id(&self) -> Option<TripId> {
        self.state.lock().await.active_id().cloned()
    }

    pub async fn active_trip(&self) -> Option<Trip> {
        let state = self.state.lock().await;
        state.active.as_ref().map(|entry| entry.trip.clone())
    }

    pub async fn cached(&self, id: &TripId) -> Option<CachedTrip> {
        self.state.lock().await.peek(id).cloned()
    }

    // ------------------------------------------------------------------------
    // Snapshot intake
    // ------------------------------------------------------------------------

    /// Adopts `trip` if it belongs to the active trip. Backward moves are
    /// adopted too and reported as regressions.
    pub async fn apply_snapshot(
        &self,
        event: SyncEvent,
        trip: Trip,
    ) -> Result<SnapshotOutcome, TripError> {
        if event.travel_id != trip.id || event.reported_status != trip.status {
            return Err(TripError::InvalidSnapshot {
                reason: format!(
                    "event for {} ({}) does not describe snapshot {} ({})",
                    event.travel_id, event.reported_status, trip.id, trip.status
                ),
            });
        }

        let source = event.source;
        let (outcome, update) = {
            let mut state = self.state.lock().await;
            if !state.is_active(&trip.id) {
                debug!(
                    trip_id = %trip.id,
                    active = ?state.active_id(),
                    %source,
                    "ignoring snapshot for inactive trip"
                );
                return Ok(SnapshotOutcome::Ignored);
            }

            let previous = state.peek(&trip.id).cloned();
            let previous_status = previous.as_ref().map(|c| c.trip.status);
            let current = trip.status;
            let regressed = previous_status.is_some_and(|p| p.is_regression_to(current));
            let contradicted = match previous.as_ref().map(|c| c.provenance) {
                Some(Provenance::Optimistic { expected, .. }) if expected != current => {
                    Some(expected)
                }
                _ => None,
            };

            let mut effects =
                LifecycleEffect::for_change(self.viewer, previous_status, &trip, source);
            if let Some(expected) = contradicted {
                effects.push(LifecycleEffect::OptimisticRejected {
                    expected,
                    actual: current,
                });
            }

            let update = (previous_status != Some(current) || contradicted.is_some()).then(|| {
                LifecycleUpdate {
                    trip_id: trip.id.clone(),
                    previous: previous_status,
                    current,
                    source,
                    effects,
                }
            });

            state.store(CachedTrip::confirmed(trip, source));

            (
                SnapshotOutcome::Applied {
                    previous: previous_status,
                    current,
                    regressed,
                    contradicted,
                },
                update,
            )
        };

        if let SnapshotOutcome::Applied {
            previous,
            current,
            regressed,
            contradicted,
        } = &outcome
        {
            if *regressed {
                warn!(trip_id = %event.travel_id, ?previous, %current, %source, "snapshot moved trip backwards");
            }
            if let Some(expected) = contradicted {
                warn!(trip_id = %event.travel_id, %expected, %current, "snapshot contradicts optimistic status");
            }
            if previous != &Some(*current) {
                info!(trip_id = %event.travel_id, ?previous, %current, %source, "trip status changed");
            }
        }
        if let Some(update) = update {
            self.publish(update);
        }
        Ok(outcome)
    }

    /// Parses a trip snapshot delivered on a `travel-<id>` channel.
    #[instrument(skip(self, event), fields(channel = %event.channel, name = %event.name))]
    pub async fn handle_push(&self, event: PushEvent) -> Result<SnapshotOutcome, TripError> {
        let Some(channel_trip) = event.channel.trip_id().cloned() else {
            debug!("account event, nothing to synchronize");
            return Ok(SnapshotOutcome::Ignored);
        };

        let trip: Trip =
            serde_json::from_value(event.payload).map_err(|e| TripError::InvalidSnapshot {
                reason: e.to_string(),
            })?;
        if trip.id != channel_trip {
            return Err(TripError::InvalidSnapshot {
                reason: format!("channel travel-{channel_trip} carried trip {}", trip.id),
            });
        }

        self.apply_snapshot(SyncEvent::from_snapshot(&trip, SnapshotSource::Push), trip)
            .await
    }

    /// Fetches the trip once and applies the result.
    #[instrument(skip_all, fields(trip_id = %id))]
    pub async fn poll_once(&self, id: &TripId) -> Result<SnapshotOutcome, TripError> {
        if !self.state.lock().await.is_active(id) {
            return Err(TripError::NotActive {
                trip_id: id.clone(),
            });
        }

        let trip = api::fetch_trip(&self.session, id).await?;
        self.apply_snapshot(SyncEvent::from_snapshot(&trip, SnapshotSource::Poll), trip)
            .await
    }

    fn publish(&self, update: LifecycleUpdate) {
        // No receivers is fine; presentation may not be listening yet.
        let _ = self.updates.send(update);
    }

    // ------------------------------------------------------------------------
    // Role operations
    // ------------------------------------------------------------------------

    #[instrument(skip_all, fields(trip_id = %id, driver_id = %driver_id))]
    pub async fn accept_trip(
        &self,
        id: &TripId,
        driver_id: &UserId,
    ) -> Result<TransitionOutcome, TripError> {
        self.require_driver(TripAction::Accept)?;
        let body = serde_json::json!({ "driverId": driver_id });
        self.transition(id, TripAction::Accept, Some(body), |trip| {
            trip.driver_id = Some(driver_id.clone());
        })
        .await
    }

    #[instrument(skip_all, fields(trip_id = %id))]
    pub async fn start_trip(&self, id: &TripId) -> Result<TransitionOutcome, TripError> {
        self.require_driver(TripAction::Start)?;
        self.transition(id, TripAction::Start, None, |_| {}).await
    }

    #[instrument(skip_all, fields(trip_id = %id))]
    pub async fn end_trip(&self, id: &TripId) -> Result<TransitionOutcome, TripError> {
        self.require_driver(TripAction::End)?;
        self.transition(id, TripAction::End, None, |_| {}).await
    }

    /// Cancels on behalf of `role`. The cached trip shows `CANCELLED` as soon
    /// as the precondition passes, whatever the backend answers; a refusal is
    /// still reported as a conflict.
    #[instrument(skip_all, fields(trip_id = %id, role = %role))]
    pub async fn cancel_trip(&self, id: &TripId, role: Role) -> Result<TransitionOutcome, TripError> {
        let action = TripAction::Cancel;
        let current = self.precondition(id, action).await?;
        let optimistic = self.record_optimistic(current, action.target_status(), |_| {}).await;

        let body = serde_json::json!({ "role": role });
        match self.dispatch(id, action, Some(body)).await? {
            Delivery::Accepted => Ok(TransitionOutcome::Applied(optimistic)),
            Delivery::TimedOut => Ok(TransitionOutcome::AwaitingConfirmation),
        }
    }

    fn require_driver(&self, action: TripAction) -> Result<(), TripError> {
        if self.viewer == Role::Driver {
            Ok(())
        } else {
            Err(TripError::RoleNotPermitted {
                action,
                role: self.viewer,
            })
        }
    }

    async fn transition(
        &self,
        id: &TripId,
        action: TripAction,
        body: Option<serde_json::Value>,
        amend: impl FnOnce(&mut Trip) + Send,
    ) -> Result<TransitionOutcome, TripError> {
        let current = self.precondition(id, action).await?;
        match self.dispatch(id, action, body).await? {
            Delivery::Accepted => {
                let trip = self
                    .record_optimistic(current, action.target_status(), amend)
                    .await;
                Ok(TransitionOutcome::Applied(trip))
            }
            Delivery::TimedOut => Ok(TransitionOutcome::AwaitingConfirmation),
        }
    }

    /// Returns the cached trip after checking that `action` is allowed from
    /// its status. Unknown trips are fetched first.
    async fn precondition(&self, id: &TripId, action: TripAction) -> Result<Trip, TripError> {
        let cached = self.state.lock().await.get(id).map(|c| c.trip.clone());
        let trip = match cached {
            Some(trip) => trip,
            None => {
                let fetched = api::fetch_trip(&self.session, id).await?;
                let mut state = self.state.lock().await;
                if state.peek(id).is_none() {
                    state.store(CachedTrip::confirmed(fetched.clone(), SnapshotSource::Poll));
                }
                fetched
            }
        };

        let target = action.target_status();
        trip.status
            .validate_transition(target)
            .map_err(|e| TripError::from_transition(id, e, target))?;
        Ok(trip)
    }

    async fn dispatch(
        &self,
        id: &TripId,
        action: TripAction,
        body: Option<serde_json::Value>,
    ) -> Result<Delivery, TripError> {
        let config = self.session.config();
        let mut request = HttpRequest::patch(config.endpoint(&action.path(id)))
            .and_then(|r| r.with_timeout(config.request_timeout()))
            .map_err(SessionError::from)?;
        if let Some(body) = body {
            request = request.with_json(&body).map_err(SessionError::from)?;
        }

        let response = match self.session.send(request).await {
            Ok(response) => response,
            Err(SessionError::Http(e)) if e.is_timeout() => {
                warn!(trip_id = %id, action = action.as_str(), "transition timed out, awaiting snapshot");
                return Ok(Delivery::TimedOut);
            }
            Err(e) => return Err(e.into()),
        };

        match response.error_for_status() {
            Ok(_) => {
                info!(trip_id = %id, action = action.as_str(), "transition accepted");
                Ok(Delivery::Accepted)
            }
            Err(HttpError::HttpStatus { status, message, .. })
                if CONFLICT_STATUSES.contains(&status) =>
            {
                warn!(trip_id = %id, action = action.as_str(), status, "transition refused");
                Err(TripError::Conflict {
                    trip_id: id.clone(),
                    message,
                })
            }
            Err(e) => Err(SessionError::from(e).into()),
        }
    }

    /// Records `target` over the precondition snapshot `trip`. When the
    /// cached status moved while the request was in flight, the newer entry
    /// wins and is returned unchanged.
    async fn record_optimistic(
        &self,
        mut trip: Trip,
        target: TripStatus,
        amend: impl FnOnce(&mut Trip),
    ) -> Trip {
        let previous = trip.status;
        let mut state = self.state.lock().await;
        let moved_on = state
            .peek(&trip.id)
            .map(|cached| &cached.trip)
            .filter(|cached| cached.status != previous)
            .cloned();
        if let Some(newer) = moved_on {
            drop(state);
            debug!(trip_id = %newer.id, %previous, cached = %newer.status, %target, "trip moved during request, keeping newer status");
            return newer;
        }

        trip.status = target;
        amend(&mut trip);
        state.store(CachedTrip {
            trip: trip.clone(),
            provenance: Provenance::Optimistic {
                expected: target,
                since: UnixTimeMs::now(),
            },
            last_source: SnapshotSource::Local,
            updated_at: UnixTimeMs::now(),
        });
        drop(state);
        debug!(trip_id = %trip.id, %previous, %target, "optimistic status recorded");

        let effects =
            LifecycleEffect::for_change(self.viewer, Some(previous), &trip, SnapshotSource::Local);
        self.publish(LifecycleUpdate {
            trip_id: trip.id.clone(),
            previous: Some(previous),
            current: target,
            source: SnapshotSource::Local,
            effects,
        });
        trip
    }
}

impl<T, S, P> TripSynchronizer<T, S, P>
where
    T: HttpTransport + 'static,
    S: KeyValueStore + 'static,
    P: PushTransport + 'static,
{
    /// Polls `id` at the configured interval until the handle is dropped,
    /// the trip stops being active, or the session ends.
    pub fn spawn_poller(self: &Arc<Self>, id: TripId) -> PollHandle {
        let every = self.session.config().poll_interval();
        poller::spawn(Arc::clone(self), id, every)
    }
}
