//! Authenticated request pipeline with single-flight credential refresh.
//!
//! Every request goes through [`SessionCoordinator::send`]. When the backend
//! answers 401 the first caller refreshes the credential while any other
//! caller that hits 401 in the meantime parks on a oneshot waiter. Each
//! request is replayed at most once; a second 401 ends the session.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    HttpError, HttpRequest, HttpResponse, HttpTransport, KeyNamespace, KeyValueStore, KvError,
    RequestKind, TypedKvStore,
};
use crate::config::{ClientConfig, ConfigError};
use crate::model::Credential;
use crate::{CREDENTIAL_KEY, ORIGIN_HEADER};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Refresh failed, the stored credential was missing or unusable, or a
    /// replayed request was rejected again. The user must sign in.
    #[error("session expired")]
    SessionExpired,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SessionError {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    access_token: String,
    refresh_token: String,
}

impl TokenPair {
    fn from_response(response: &HttpResponse) -> Result<Credential, SessionError> {
        let pair: Self = response
            .json()
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        let credential = Credential::new(pair.access_token, pair.refresh_token);
        if credential.is_well_formed() {
            Ok(credential)
        } else {
            Err(SessionError::Serialization(
                "token response contained blank tokens".to_string(),
            ))
        }
    }
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

// ============================================================================
// Credential persistence
// ============================================================================

/// The single persisted credential entry (`session:credential`).
pub struct CredentialStore<S> {
    store: TypedKvStore<Credential, S>,
}

impl<S: KeyValueStore> CredentialStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store: TypedKvStore::new(KeyNamespace::Session, store),
        }
    }

    pub async fn load(&self) -> Result<Option<Credential>, KvError> {
        self.store.load(CREDENTIAL_KEY).await
    }

    /// Loads the credential, treating undecodable or blank entries as absent.
    pub async fn load_usable(&self) -> Result<Option<Credential>, KvError> {
        match self.load().await {
            Ok(Some(credential)) if credential.is_well_formed() => Ok(Some(credential)),
            Ok(Some(_)) => {
                warn!("stored credential is incomplete");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(KvError::Serialization { message, .. }) => {
                warn!(error = %message, "stored credential is malformed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, credential: &Credential) -> Result<(), KvError> {
        self.store.save(CREDENTIAL_KEY, credential).await
    }

    pub async fn clear(&self) -> Result<bool, KvError> {
        self.store.remove(CREDENTIAL_KEY).await
    }
}

// ============================================================================
// Refresh coordination
// ============================================================================

type RefreshOutcome = Result<Credential, SessionError>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Held by the caller performing the refresh. Dropping it without
/// `finish` (leader cancelled) releases the waiters with a closed channel.
struct LeaderGuard<'a> {
    state: &'a Mutex<RefreshState>,
    armed: bool,
}

impl LeaderGuard<'_> {
    fn finish(mut self, outcome: &RefreshOutcome) {
        self.armed = false;
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "releasing refresh waiters");
        for waiter in waiters {
            // A waiter whose request was dropped has nothing to resume.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight = false;
            state.waiters.clear();
        }
    }
}

enum RefreshTurn<'a> {
    Leader(LeaderGuard<'a>),
    Follower(oneshot::Receiver<RefreshOutcome>),
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SessionCoordinator<T, S> {
    config: ClientConfig,
    transport: Arc<T>,
    credentials: CredentialStore<S>,
    refresh: Mutex<RefreshState>,
    expired: watch::Sender<bool>,
}

impl<T: HttpTransport, S: KeyValueStore> SessionCoordinator<T, S> {
    pub fn new(config: ClientConfig, transport: Arc<T>, store: Arc<S>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (expired, _) = watch::channel(false);
        Ok(Self {
            config,
            transport,
            credentials: CredentialStore::new(store),
            refresh: Mutex::new(RefreshState::default()),
            expired,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore<S> {
        &self.credentials
    }

    /// Flips to `true` when the session becomes unrecoverable.
    pub fn subscribe_expiry(&self) -> watch::Receiver<bool> {
        self.expired.subscribe()
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(self.credentials.load_usable().await, Ok(Some(_)))
    }

    /// Sends an authenticated request. Any HTTP status other than 401 is
    /// returned untouched; 401 on a standard request triggers refresh and a
    /// single replay.
    #[instrument(
        skip(self, request),
        fields(
            method = request.method().as_str(),
            path = %request.url().path_and_query(),
            request_id = request.request_id(),
        )
    )]
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, SessionError> {
        let credential = self.credentials.load_usable().await?;
        let sent_with = credential.as_ref().map(|c| c.access_token().to_string());
        self.decorate(&mut request, credential.as_ref())?;

        let response = self.dispatch(request.clone()).await?;
        if !response.is_unauthenticated()
            || request.kind().is_auth_endpoint()
            || request.is_retried()
        {
            return Ok(response);
        }

        debug!("request unauthenticated, recovering session");
        let fresh = self.recover(sent_with.as_deref()).await?;
        self.replay(request, &fresh).await
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), SessionError> {
        self.authenticate(LOGIN_PATH, RequestKind::Login, &LoginBody { email, password })
            .await
    }

    #[instrument(skip_all)]
    pub async fn register<B: Serialize + Sync>(&self, body: &B) -> Result<(), SessionError> {
        self.authenticate(REGISTER_PATH, RequestKind::Register, body).await
    }

    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let existed = self.credentials.clear().await?;
        info!(existed, "signed out");
        Ok(())
    }

    async fn authenticate<B: Serialize + Sync>(
        &self,
        path: &str,
        kind: RequestKind,
        body: &B,
    ) -> Result<(), SessionError> {
        let mut request = HttpRequest::post(self.config.endpoint(path))?
            .with_kind(kind)
            .with_timeout(self.config.request_timeout())?
            .with_json(body)?;
        self.decorate(&mut request, None)?;

        let response = self.dispatch(request).await?.error_for_status()?;
        let credential = TokenPair::from_response(&response)?;
        self.credentials.save(&credential).await?;
        self.expired.send_replace(false);
        info!(fingerprint = %credential.fingerprint(), "session established");
        Ok(())
    }

    fn decorate(
        &self,
        request: &mut HttpRequest,
        credential: Option<&Credential>,
    ) -> Result<(), HttpError> {
        request.set_header(ORIGIN_HEADER, self.config.origin.as_str())?;
        if let Some(credential) = credential {
            request.set_bearer(credential.access_token())?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let limit = request.timeout();
        let request_id = request.request_id().to_string();
        match tokio::time::timeout(limit, self.transport.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(HttpError::Timeout {
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                request_id,
            }),
        }
    }

    fn take_turn(&self) -> RefreshTurn<'_> {
        let mut state = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            RefreshTurn::Follower(rx)
        } else {
            state.in_flight = true;
            RefreshTurn::Leader(LeaderGuard {
                state: &self.refresh,
                armed: true,
            })
        }
    }

    async fn recover(&self, sent_with: Option<&str>) -> RefreshOutcome {
        match self.take_turn() {
            RefreshTurn::Follower(rx) => {
                debug!("refresh in flight, waiting");
                rx.await.unwrap_or_else(|_| {
                    Err(SessionError::Http(HttpError::Cancelled {
                        request_id: "refresh".to_string(),
                    }))
                })
            }
            RefreshTurn::Leader(guard) => {
                let outcome = self.refresh_credential(sent_with).await;
                guard.finish(&outcome);
                outcome
            }
        }
    }

    async fn refresh_credential(&self, sent_with: Option<&str>) -> RefreshOutcome {
        let Some(stored) = self.credentials.load_usable().await? else {
            warn!("no usable credential to refresh");
            self.expire().await;
            return Err(SessionError::SessionExpired);
        };

        if sent_with != Some(stored.access_token()) {
            debug!(fingerprint = %stored.fingerprint(), "credential already rotated, skipping refresh");
            return Ok(stored);
        }

        let mut request = HttpRequest::post(self.config.endpoint(REFRESH_PATH))?
            .with_kind(RequestKind::Refresh)
            .with_timeout(self.config.refresh_timeout())?;
        self.decorate(&mut request, None)?;
        request.set_bearer(stored.refresh_token())?;

        let response = match self.dispatch(request).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                warn!(status = response.status(), "refresh rejected");
                self.expire().await;
                return Err(SessionError::SessionExpired);
            }
            Err(e) => {
                warn!(error = %e, "refresh request failed");
                self.expire().await;
                return Err(SessionError::SessionExpired);
            }
        };

        let credential = match TokenPair::from_response(&response) {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "refresh returned an unusable token pair");
                self.expire().await;
                return Err(SessionError::SessionExpired);
            }
        };

        self.credentials.save(&credential).await?;
        info!(
            previous = %stored.fingerprint(),
            current = %credential.fingerprint(),
            "credential refreshed"
        );
        Ok(credential)
    }

    async fn replay(
        &self,
        mut request: HttpRequest,
        credential: &Credential,
    ) -> Result<HttpResponse, SessionError> {
        request.mark_retried();
        request.set_bearer(credential.access_token())?;

        let response = self.dispatch(request).await?;
        if response.is_unauthenticated() {
            warn!("replayed request rejected, ending session");
            self.expire().await;
            return Err(SessionError::SessionExpired);
        }
        Ok(response)
    }

    async fn expire(&self) {
        if let Err(e) = self.credentials.clear().await {
            warn!(error = %e, "failed to wipe credential");
        }
        self.expired.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;
    use crate::testing::{signed_in_session, test_config, FakeBackend, BASE_URL};
    use std::time::Duration;

    fn get(path: &str) -> HttpRequest {
        HttpRequest::get(format!("{BASE_URL}{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_send_attaches_bearer_and_origin() {
        let (backend, _store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;

        let response = session.send(get("/profile")).await.unwrap();
        assert_eq!(response.status(), 200);

        let sent = backend.requests_to("/profile").await;
        assert_eq!(sent[0].bearer(), Some("access-0"));
        assert_eq!(sent[0].headers().get(ORIGIN_HEADER), Some("mobile"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_replayed_once() {
        let (backend, store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;
        backend.expire_access_token().await;

        let response = session.send(get("/profile")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(backend.refresh_calls().await, 1);

        let sent = backend.requests_to("/profile").await;
        assert_eq!(sent.len(), 2);
        assert!(sent[1].is_retried());
        assert_eq!(sent[1].bearer(), Some("access-1"));

        let stored = CredentialStore::new(store).load().await.unwrap().unwrap();
        assert_eq!(stored, Credential::new("access-1", "refresh-1"));
    }

    #[tokio::test]
    async fn test_concurrent_expiry_triggers_single_refresh() {
        let backend = FakeBackend::new("access-0", "refresh-0").with_refresh_delay(Duration::from_millis(50));
        let (backend, _store, session) = signed_in_session(backend).await;
        backend.expire_access_token().await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.send(get("/profile")).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status(), 200);
        }

        assert_eq!(backend.refresh_calls().await, 1);
        let replays: Vec<_> = backend
            .requests_to("/profile")
            .await
            .into_iter()
            .filter(HttpRequest::is_retried)
            .collect();
        assert_eq!(replays.len(), 5);
        assert!(replays.iter().all(|r| r.bearer() == Some("access-1")));
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_and_wipes() {
        let (backend, store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;
        backend.expire_access_token().await;
        backend.fail_refresh().await;
        let expiry = session.subscribe_expiry();

        let result = session.send(get("/profile")).await;
        assert_eq!(result.unwrap_err(), SessionError::SessionExpired);
        assert!(store.is_empty().await);
        assert!(*expiry.borrow());
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_replay_rejected_is_hard_failure() {
        let (backend, store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;
        backend.reject_all().await;

        let result = session.send(get("/profile")).await;
        assert_eq!(result.unwrap_err(), SessionError::SessionExpired);
        assert_eq!(backend.refresh_calls().await, 1);
        assert_eq!(backend.requests_to("/profile").await.len(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_credential_expires_without_network_refresh() {
        let backend = Arc::new(FakeBackend::new("access-0", "refresh-0"));
        let store = Arc::new(MemoryKvStore::new());
        store.put_raw("session:credential", b"{\"accessToken\":".to_vec()).await;
        let session = SessionCoordinator::new(test_config(), Arc::clone(&backend), Arc::clone(&store)).unwrap();

        let result = session.send(get("/profile")).await;
        assert_eq!(result.unwrap_err(), SessionError::SessionExpired);
        assert_eq!(backend.refresh_calls().await, 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_auth_endpoints_pass_401_through() {
        let (backend, _store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;
        backend.reject_all().await;

        let request = get("/profile").with_kind(RequestKind::Login);
        let response = session.send(request).await.unwrap();
        assert_eq!(response.status(), 401);
        assert_eq!(backend.refresh_calls().await, 0);
    }

    #[tokio::test]
    async fn test_network_failure_passes_through_untouched() {
        let (backend, store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;
        backend.set_offline(true).await;

        let result = session.send(get("/profile")).await;
        assert!(matches!(result, Err(SessionError::Http(HttpError::ConnectionError { .. }))));
        assert!(!store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sign_in_persists_pair_and_clears_expiry() {
        let backend = Arc::new(FakeBackend::new("unused", "unused"));
        let store = Arc::new(MemoryKvStore::new());
        let session = SessionCoordinator::new(test_config(), Arc::clone(&backend), Arc::clone(&store)).unwrap();
        assert!(!session.is_authenticated().await);

        session.sign_in("rider@example.com", "hunter2").await.unwrap();
        assert!(session.is_authenticated().await);
        assert!(!*session.subscribe_expiry().borrow());

        session.send(get("/profile")).await.unwrap();
        let sent = backend.requests_to("/profile").await;
        assert_eq!(sent[0].bearer(), Some("access-1"));

        session.sign_out().await.unwrap();
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_stale_token_is_replayed_without_second_refresh() {
        let (backend, store, session) = signed_in_session(FakeBackend::new("access-0", "refresh-0")).await;
        backend.expire_access_token().await;
        session.send(get("/profile")).await.unwrap();
        assert_eq!(backend.refresh_calls().await, 1);

        // A request that was sent with the old token and failed after rotation.
        let credentials = CredentialStore::new(Arc::clone(&store));
        let recovered = session.recover(Some("access-0")).await.unwrap();
        assert_eq!(recovered, credentials.load().await.unwrap().unwrap());
        assert_eq!(backend.refresh_calls().await, 1);
    }
}
