use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capabilities::{HttpTransport, KeyValueStore, PushTransport};
use crate::model::TripId;
use crate::session::SessionError;
use crate::trip::{TripError, TripSynchronizer};
use crate::{MAX_POLL_BACKOFF_MS, POLL_JITTER_MAX_MS};

/// Running poll loop for one trip. Dropping the handle stops the loop.
#[must_use = "the poller stops as soon as its handle is dropped"]
pub struct PollHandle {
    trip_id: TripId,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn trip_id(&self) -> &TripId {
        &self.trip_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!(trip_id = %self.trip_id, "cancelling poller");
        }
        self.task.abort();
    }
}

/// Extra wait after `failures` consecutive failed polls, on top of the
/// regular interval.
#[must_use]
pub fn backoff_delay(base: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let exponent = (failures - 1).min(16);
    let capped = base_ms.saturating_mul(1u64 << exponent).min(MAX_POLL_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=POLL_JITTER_MAX_MS);
    Duration::from_millis(capped.saturating_add(jitter))
}

pub(crate) fn spawn<T, S, P>(
    sync: Arc<TripSynchronizer<T, S, P>>,
    trip_id: TripId,
    every: Duration,
) -> PollHandle
where
    T: HttpTransport + 'static,
    S: KeyValueStore + 'static,
    P: PushTransport + 'static,
{
    let id = trip_id.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            ticker.tick().await;
            match sync.poll_once(&id).await {
                Ok(outcome) => {
                    failures = 0;
                    debug!(trip_id = %id, ?outcome, "poll applied");
                }
                Err(TripError::NotActive { .. }) => {
                    info!(trip_id = %id, "trip no longer active, poller stopping");
                    break;
                }
                Err(TripError::Session(SessionError::SessionExpired)) => {
                    warn!(trip_id = %id, "session expired, poller stopping");
                    break;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff_delay(every, failures);
                    warn!(trip_id = %id, error = %e, failures, ?delay, "poll failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });

    PollHandle { trip_id, task }
}
