#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shared::capabilities::{
    ChannelName, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport, KeyNamespace,
    KeyValueStore, KvKey, MemoryKvStore, PushResult, PushTransport,
};
use shared::{ClientConfig, Credential, SessionCoordinator, Trip, TripStatus, UserId};
use tokio::sync::Mutex;

pub const BASE_URL: &str = "https://transfers.test";

#[derive(Default)]
struct State {
    access: String,
    refresh: String,
    generation: u32,
    refresh_calls: u32,
    trips: HashMap<String, Trip>,
    listing: Vec<Trip>,
    authorized: Vec<(String, String)>,
}

/// In-process backend: token rotation, trips by id, PATCH transitions and a
/// paged `/travels/requests` listing.
pub struct Backend {
    state: Mutex<State>,
    refresh_delay: Duration,
}

impl Backend {
    pub fn new(refresh_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                access: "access-0".into(),
                refresh: "refresh-0".into(),
                ..State::default()
            }),
            refresh_delay,
        }
    }

    pub async fn expire_access(&self) {
        self.state.lock().await.access = "revoked".into();
    }

    pub async fn refresh_calls(&self) -> u32 {
        self.state.lock().await.refresh_calls
    }

    /// `(path, bearer)` of every request the backend accepted.
    pub async fn authorized(&self) -> Vec<(String, String)> {
        self.state.lock().await.authorized.clone()
    }

    pub async fn put_trip(&self, trip: Trip) {
        self.state.lock().await.trips.insert(trip.id.0.clone(), trip);
    }

    pub async fn set_status(&self, id: &str, status: TripStatus) {
        if let Some(trip) = self.state.lock().await.trips.get_mut(id) {
            trip.status = status;
        }
    }

    pub async fn set_listing(&self, trips: Vec<Trip>) {
        self.state.lock().await.listing = trips;
    }

    fn tokens(state: &mut State) -> HttpResponse {
        state.generation += 1;
        state.access = format!("access-{}", state.generation);
        state.refresh = format!("refresh-{}", state.generation);
        HttpResponse::json_body(
            200,
            &serde_json::json!({"accessToken": state.access, "refreshToken": state.refresh}),
        )
    }

    fn page(state: &State, query: &str) -> HttpResponse {
        let param = |name: &str| {
            query
                .split('&')
                .find_map(|kv| kv.strip_prefix(name)?.strip_prefix('='))
                .and_then(|v| v.parse::<usize>().ok())
        };
        let page = param("page").unwrap_or(0);
        let per_page = param("itemsPerPage").unwrap_or(10);
        let items: Vec<&Trip> = state.listing.iter().skip(page * per_page).take(per_page).collect();
        HttpResponse::json_body(200, &serde_json::json!({ "hydra:member": items }))
    }
}

#[async_trait::async_trait]
impl HttpTransport for Backend {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let full = request.url().path_and_query();
        let (path, query) = full.split_once('?').unwrap_or((full.as_str(), ""));

        if path == "/auth/refresh" {
            self.state.lock().await.refresh_calls += 1;
            tokio::time::sleep(self.refresh_delay).await;
            let mut state = self.state.lock().await;
            if request.bearer() != Some(state.refresh.as_str()) {
                return Ok(HttpResponse::json_body(401, &serde_json::json!({"message": "bad refresh"})));
            }
            return Ok(Self::tokens(&mut state));
        }

        let mut state = self.state.lock().await;
        if path == "/auth/login" {
            return Ok(Self::tokens(&mut state));
        }
        let bearer = request.bearer().unwrap_or_default().to_string();
        if bearer != state.access {
            return Ok(HttpResponse::json_body(401, &serde_json::json!({"message": "expired"})));
        }
        state.authorized.push((path.to_string(), bearer));

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let response = match (request.method(), segments.as_slice()) {
            (HttpMethod::Get, ["travels", "requests"]) => Self::page(&state, query),
            (HttpMethod::Get, ["travels", id]) => match state.trips.get(*id) {
                Some(trip) => HttpResponse::json_body(200, trip),
                None => HttpResponse::json_body(404, &serde_json::json!({"message": "missing"})),
            },
            (HttpMethod::Patch, ["travels", id, action]) => {
                let target = match *action {
                    "accept" => TripStatus::Accept,
                    "start" => TripStatus::Start,
                    "end" => TripStatus::End,
                    _ => TripStatus::Cancelled,
                };
                match state.trips.get_mut(*id) {
                    Some(trip) if trip.status.can_transition_to(target) => {
                        trip.status = target;
                        if target == TripStatus::Accept {
                            let body: serde_json::Value =
                                serde_json::from_slice(request.body().unwrap_or(b"{}")).unwrap_or_default();
                            trip.driver_id = body["driverId"].as_str().map(UserId::new);
                        }
                        HttpResponse::json_body(200, &trip.clone())
                    }
                    Some(_) => HttpResponse::json_body(409, &serde_json::json!({"message": "taken"})),
                    None => HttpResponse::json_body(404, &serde_json::json!({"message": "missing"})),
                }
            }
            _ => HttpResponse::json_body(200, &serde_json::json!({})),
        };
        Ok(response)
    }
}

#[derive(Default)]
pub struct Push {
    joined: Mutex<Vec<String>>,
}

impl Push {
    pub async fn joined(&self) -> Vec<String> {
        self.joined.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PushTransport for Push {
    async fn join(&self, channel: &ChannelName) -> PushResult {
        self.joined.lock().await.push(channel.to_string());
        Ok(())
    }

    async fn leave(&self, _channel: &ChannelName) -> PushResult {
        Ok(())
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::default().with_base_url(BASE_URL)
}

pub async fn session(
    backend: &Arc<Backend>,
) -> (Arc<MemoryKvStore>, Arc<SessionCoordinator<Backend, MemoryKvStore>>) {
    let store = Arc::new(MemoryKvStore::new());
    let key = KvKey::new(KeyNamespace::Session, "credential").unwrap();
    store
        .set(&key, serde_json::to_vec(&Credential::new("access-0", "refresh-0")).unwrap())
        .await
        .unwrap();
    let session = SessionCoordinator::new(config(), Arc::clone(backend), Arc::clone(&store)).unwrap();
    (store, Arc::new(session))
}
