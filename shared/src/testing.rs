//! In-process fakes for the capability seams used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::capabilities::{
    ChannelName, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    KeyNamespace, KeyValueStore, KvKey, MemoryKvStore, PushResult, PushTransport,
};
use crate::config::ClientConfig;
use crate::model::{Credential, Trip, TripStatus, UserId};
use crate::session::SessionCoordinator;

pub const BASE_URL: &str = "https://api.example.com";

pub fn test_config() -> ClientConfig {
    ClientConfig::default().with_base_url(BASE_URL)
}

#[derive(Default)]
struct BackendState {
    access_token: String,
    refresh_token: String,
    issued: u32,
    refresh_calls: u32,
    fail_refresh: bool,
    reject_all: bool,
    log: Vec<HttpRequest>,
    trips: HashMap<String, Trip>,
    rejections: HashMap<(String, String), u16>,
    timeouts: HashSet<String>,
    delays: HashMap<String, Duration>,
    offline: bool,
}

/// Scripted backend: accepts only the latest issued access token and
/// rotates the pair on every refresh.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    refresh_delay: Duration,
}

impl FakeBackend {
    pub fn new(access_token: &str, refresh_token: &str) -> Self {
        Self {
            state: Mutex::new(BackendState {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                ..BackendState::default()
            }),
            refresh_delay: Duration::ZERO,
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Invalidates the current access token without issuing a new one.
    pub async fn expire_access_token(&self) {
        self.state.lock().await.access_token = "expired-server-side".to_string();
    }

    pub async fn fail_refresh(&self) {
        self.state.lock().await.fail_refresh = true;
    }

    /// Every non-auth request answers 401, even with a fresh token.
    pub async fn reject_all(&self) {
        self.state.lock().await.reject_all = true;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn put_trip(&self, trip: Trip) {
        self.state.lock().await.trips.insert(trip.id.0.clone(), trip);
    }

    pub async fn set_status(&self, id: &str, status: TripStatus) {
        if let Some(trip) = self.state.lock().await.trips.get_mut(id) {
            trip.status = status;
        }
    }

    pub async fn reject_action(&self, id: &str, action: &str, status: u16) {
        self.state
            .lock()
            .await
            .rejections
            .insert((id.to_string(), action.to_string()), status);
    }

    pub async fn time_out_path(&self, path: &str) {
        self.state.lock().await.timeouts.insert(path.to_string());
    }

    /// Holds responses for `path` back by `delay` before answering.
    pub async fn delay_path(&self, path: &str, delay: Duration) {
        self.state.lock().await.delays.insert(path.to_string(), delay);
    }

    pub async fn refresh_calls(&self) -> u32 {
        self.state.lock().await.refresh_calls
    }

    pub async fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|r| r.url().path_and_query() == path)
            .cloned()
            .collect()
    }

    async fn handle_refresh(&self, request: &HttpRequest) -> HttpResponse {
        {
            self.state.lock().await.refresh_calls += 1;
        }
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_refresh || request.bearer() != Some(state.refresh_token.as_str()) {
            return HttpResponse::json_body(401, &serde_json::json!({"message": "invalid refresh token"}));
        }
        state.issued += 1;
        state.access_token = format!("access-{}", state.issued);
        state.refresh_token = format!("refresh-{}", state.issued);
        HttpResponse::json_body(
            200,
            &serde_json::json!({
                "accessToken": state.access_token,
                "refreshToken": state.refresh_token,
            }),
        )
    }

    fn transition(trip: &mut Trip, action: &str, body: Option<&[u8]>) -> Option<TripStatus> {
        let target = match action {
            "accept" => TripStatus::Accept,
            "start" => TripStatus::Start,
            "end" => TripStatus::End,
            "cancel" => TripStatus::Cancelled,
            _ => return None,
        };
        trip.status.validate_transition(target).ok()?;
        if action == "accept" {
            let driver = body
                .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
                .and_then(|v| v["driverId"].as_str().map(UserId::new));
            trip.driver_id = driver;
        }
        trip.status = target;
        Some(target)
    }
}

#[async_trait::async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let path = request.url().path_and_query();
        let delay = {
            let mut state = self.state.lock().await;
            state.log.push(request.clone());
            if state.offline {
                return Err(HttpError::ConnectionError {
                    host: request.url().host().to_string(),
                    message: "offline".to_string(),
                });
            }
            if state.timeouts.contains(&path) {
                return Err(HttpError::Timeout {
                    timeout_ms: u64::try_from(request.timeout().as_millis()).unwrap_or(u64::MAX),
                    request_id: request.request_id().to_string(),
                });
            }
            state.delays.get(&path).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if path == "/auth/refresh" {
            return Ok(self.handle_refresh(&request).await);
        }
        if path == "/auth/login" || path == "/auth/register" {
            let mut state = self.state.lock().await;
            state.issued += 1;
            state.access_token = format!("access-{}", state.issued);
            state.refresh_token = format!("refresh-{}", state.issued);
            return Ok(HttpResponse::json_body(
                200,
                &serde_json::json!({
                    "accessToken": state.access_token,
                    "refreshToken": state.refresh_token,
                }),
            ));
        }

        let mut state = self.state.lock().await;
        if state.reject_all || request.bearer() != Some(state.access_token.as_str()) {
            return Ok(HttpResponse::json_body(401, &serde_json::json!({"message": "jwt expired"})));
        }

        let segments: Vec<&str> = path
            .split('?')
            .next()
            .unwrap_or_default()
            .trim_matches('/')
            .split('/')
            .collect();

        match (request.method(), segments.as_slice()) {
            (HttpMethod::Get, ["travels", id]) => Ok(match state.trips.get(*id) {
                Some(trip) => HttpResponse::json_body(200, trip),
                None => HttpResponse::json_body(404, &serde_json::json!({"message": "not found"})),
            }),
            (HttpMethod::Patch, ["travels", id, action]) => {
                if let Some(status) = state.rejections.get(&((*id).to_string(), (*action).to_string())) {
                    return Ok(HttpResponse::json_body(
                        *status,
                        &serde_json::json!({"message": "travel no longer available"}),
                    ));
                }
                let Some(trip) = state.trips.get_mut(*id) else {
                    return Ok(HttpResponse::json_body(404, &serde_json::json!({"message": "not found"})));
                };
                match Self::transition(trip, action, request.body()) {
                    Some(_) => Ok(HttpResponse::json_body(200, &trip.clone())),
                    None => Ok(HttpResponse::json_body(
                        409,
                        &serde_json::json!({"message": "invalid status"}),
                    )),
                }
            }
            (HttpMethod::Get, ["profile"]) => {
                Ok(HttpResponse::json_body(200, &serde_json::json!({"id": "me"})))
            }
            _ => Ok(HttpResponse::json_body(404, &serde_json::json!({"message": "no route"}))),
        }
    }
}

/// Records push joins/leaves in order.
#[derive(Default)]
pub struct RecordingPush {
    joins: Mutex<Vec<String>>,
    leaves: Mutex<Vec<String>>,
}

impl RecordingPush {
    pub async fn joins(&self) -> Vec<String> {
        self.joins.lock().await.clone()
    }

    pub async fn leaves(&self) -> Vec<String> {
        self.leaves.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PushTransport for RecordingPush {
    async fn join(&self, channel: &ChannelName) -> PushResult {
        self.joins.lock().await.push(channel.to_string());
        Ok(())
    }

    async fn leave(&self, channel: &ChannelName) -> PushResult {
        self.leaves.lock().await.push(channel.to_string());
        Ok(())
    }
}

async fn seed_credential(store: &MemoryKvStore, credential: &Credential) {
    let key = KvKey::new(KeyNamespace::Session, crate::CREDENTIAL_KEY).unwrap();
    store
        .set(&key, serde_json::to_vec(credential).unwrap())
        .await
        .unwrap();
}

type SignedIn = (
    Arc<FakeBackend>,
    Arc<MemoryKvStore>,
    Arc<SessionCoordinator<FakeBackend, MemoryKvStore>>,
);

/// Session wired to a fresh backend and a store holding `access-0`/`refresh-0`.
pub async fn signed_in_session(backend: FakeBackend) -> SignedIn {
    signed_in_session_with(backend, test_config()).await
}

pub async fn signed_in_session_with(backend: FakeBackend, config: ClientConfig) -> SignedIn {
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryKvStore::new());
    seed_credential(&store, &Credential::new("access-0", "refresh-0")).await;
    let session = Arc::new(
        SessionCoordinator::new(config, Arc::clone(&backend), Arc::clone(&store)).unwrap(),
    );
    (backend, store, session)
}
