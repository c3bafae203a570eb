//! Backend routes and the typed fetches built on the session pipeline.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::capabilities::{HttpRequest, HttpResponse, HttpTransport, KeyValueStore};
use crate::model::{Trip, TripId, TripStatus};
use crate::session::{SessionCoordinator, SessionError};

pub const TRAVELS_PATH: &str = "/travels";

#[must_use]
pub fn travel_path(id: &TripId) -> String {
    format!("{TRAVELS_PATH}/{id}")
}

/// Status-changing operations exposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripAction {
    Accept,
    Start,
    End,
    Cancel,
}

impl TripAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Start => "start",
            Self::End => "end",
            Self::Cancel => "cancel",
        }
    }

    #[must_use]
    pub const fn target_status(self) -> TripStatus {
        match self {
            Self::Accept => TripStatus::Accept,
            Self::Start => TripStatus::Start,
            Self::End => TripStatus::End,
            Self::Cancel => TripStatus::Cancelled,
        }
    }

    #[must_use]
    pub fn path(self, id: &TripId) -> String {
        format!("{}/{}", travel_path(id), self.as_str())
    }
}

impl std::fmt::Display for TripAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collections the apps page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListResource {
    /// Open requests a driver can accept.
    TripRequests,
    /// The viewer's upcoming trips.
    Bookings,
    History,
    Notifications,
    Commissions,
}

impl ListResource {
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::TripRequests => "/travels/requests",
            Self::Bookings => "/travels/bookings",
            Self::History => "/travels/history",
            Self::Notifications => "/notifications",
            Self::Commissions => "/commissions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub page: u32,
    pub items_per_page: u32,
}

impl PageQuery {
    #[must_use]
    pub const fn new(page: u32, items_per_page: u32) -> Self {
        Self { page, items_per_page }
    }

    /// Newest first, zero-based page.
    #[must_use]
    pub fn to_query_string(self) -> String {
        format!(
            "page={}&itemsPerPage={}&order[createdAt]=desc",
            self.page, self.items_per_page
        )
    }
}

/// Lists arrive either as a bare array or wrapped in a hydra collection.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Plain(Vec<T>),
    Hydra {
        #[serde(rename = "hydra:member")]
        member: Vec<T>,
    },
}

impl<T> ListBody<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Self::Plain(items) | Self::Hydra { member: items } => items,
        }
    }
}

fn decode<T: DeserializeOwned>(response: HttpResponse) -> Result<T, SessionError> {
    let response = response.error_for_status()?;
    Ok(response.json()?)
}

#[instrument(skip(session), fields(trip_id = %id))]
pub async fn fetch_trip<T, S>(
    session: &SessionCoordinator<T, S>,
    id: &TripId,
) -> Result<Trip, SessionError>
where
    T: HttpTransport,
    S: KeyValueStore,
{
    let request = HttpRequest::get(session.config().endpoint(&travel_path(id)))?
        .with_timeout(session.config().request_timeout())?;
    decode(session.send(request).await?)
}

#[instrument(skip(session))]
pub async fn fetch_page<I, T, S>(
    session: &SessionCoordinator<T, S>,
    resource: ListResource,
    query: PageQuery,
) -> Result<Vec<I>, SessionError>
where
    I: DeserializeOwned,
    T: HttpTransport,
    S: KeyValueStore,
{
    let url = format!(
        "{}?{}",
        session.config().endpoint(resource.path()),
        query.to_query_string()
    );
    let request = HttpRequest::get(url)?.with_timeout(session.config().request_timeout())?;
    let body: ListBody<I> = decode(session.send(request).await?)?;
    Ok(body.into_items())
}
