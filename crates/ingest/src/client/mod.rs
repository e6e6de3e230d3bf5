//! Fetch clients for the upstream APIs.
//!
//! Clients never return errors: every HTTP or decoding failure is classified
//! into a [`FetchOutcome`] here, and the scheduler only branches on that.

mod osu;
mod osutrack;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use otr_core::{EntityKind, ExternalApi, ExternalId};

use crate::model::{FetchContext, FetchedEntity};

pub use osu::OsuApiClient;
pub use osutrack::OsuTrackClient;

/// Result of one fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(FetchedEntity),
    NotFound,
    RateLimited { retry_after: Option<Duration> },
    TransientError(String),
    PermanentError(String),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::RateLimited { .. } => "rate_limited",
            FetchOutcome::TransientError(_) => "transient_error",
            FetchOutcome::PermanentError(_) => "permanent_error",
        }
    }
}

#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        context: Option<&FetchContext>,
    ) -> FetchOutcome;
}

#[async_trait]
impl<T: FetchClient + ?Sized> FetchClient for Arc<T> {
    async fn fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        context: Option<&FetchContext>,
    ) -> FetchOutcome {
        (**self).fetch(kind, external_id, context).await
    }
}

/// Routes each entity kind to the client for its API.
pub struct ApiFetchClient {
    osu: Arc<dyn FetchClient>,
    osu_track: Arc<dyn FetchClient>,
}

impl ApiFetchClient {
    pub fn new(osu: Arc<dyn FetchClient>, osu_track: Arc<dyn FetchClient>) -> Self {
        Self { osu, osu_track }
    }
}

#[async_trait]
impl FetchClient for ApiFetchClient {
    async fn fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        context: Option<&FetchContext>,
    ) -> FetchOutcome {
        match kind.api() {
            ExternalApi::Osu => self.osu.fetch(kind, external_id, context).await,
            ExternalApi::OsuTrack => self.osu_track.fetch(kind, external_id, context).await,
        }
    }
}

// ── Classification ───────────────────────────────────────────────────

/// A request either yields a value or has already been classified.
pub(crate) type Attempt<T> = Result<T, FetchOutcome>;

/// Map a non-success status to its outcome. `None` for 2xx.
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<&str>) -> Option<FetchOutcome> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND => FetchOutcome::NotFound,
        StatusCode::TOO_MANY_REQUESTS => FetchOutcome::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::REQUEST_TIMEOUT => FetchOutcome::TransientError(status.to_string()),
        s if s.is_server_error() => FetchOutcome::TransientError(s.to_string()),
        s => FetchOutcome::PermanentError(s.to_string()),
    })
}

/// Map a transport-level error to its outcome.
pub(crate) fn classify_error(err: &reqwest::Error) -> FetchOutcome {
    if err.is_decode() || err.is_builder() {
        FetchOutcome::PermanentError(err.to_string())
    } else {
        // timeouts, refused connections, truncated bodies
        FetchOutcome::TransientError(err.to_string())
    }
}

pub(crate) fn check_status(response: Response) -> Attempt<Response> {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok());
    match classify_status(response.status(), retry_after) {
        None => Ok(response),
        Some(outcome) => Err(outcome),
    }
}

pub(crate) async fn decode_json<T: DeserializeOwned>(response: Response) -> Attempt<T> {
    let body = response.bytes().await.map_err(|e| classify_error(&e))?;
    serde_json::from_slice(&body)
        .map_err(|e| FetchOutcome::PermanentError(format!("undecodable response body: {e}")))
}

pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Attempt<T> {
    let response = request.send().await.map_err(|e| classify_error(&e))?;
    decode_json(check_status(response)?).await
}

fn into_outcome(attempt: Attempt<FetchedEntity>) -> FetchOutcome {
    match attempt {
        Ok(entity) => FetchOutcome::Success(entity),
        Err(outcome) => outcome,
    }
}
