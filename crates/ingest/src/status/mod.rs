//! Per-entity fetch status.
//!
//! The store is the only place that decides whether a fetch may start:
//! [`FetchStatusStore::try_begin_fetch`] is a single compare-and-swap, so two
//! consumers handling the same entity can never both be admitted.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use otr_core::{EntityKey, EntityKind, ExternalId, FetchStatus};

use crate::error::StoreError;

pub use memory::MemoryFetchStatusStore;
pub use postgres::PgFetchStatusStore;

/// `last_error` written by the reconciler.
pub const STALE_FETCH_ERROR: &str = "stale fetch";

/// Stored state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRecord {
    pub kind: EntityKind,
    pub external_id: ExternalId,
    pub internal_id: i64,
    pub status: FetchStatus,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl FetchRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.external_id)
    }
}

/// How an admitted fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Fetched,
    NotFound,
    Error(String),
}

impl CompletionOutcome {
    pub fn status(&self) -> FetchStatus {
        match self {
            CompletionOutcome::Fetched => FetchStatus::Fetched,
            CompletionOutcome::NotFound => FetchStatus::NotFound,
            CompletionOutcome::Error(_) => FetchStatus::Error,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CompletionOutcome::Error(e) => Some(e),
            _ => None,
        }
    }
}

#[async_trait]
pub trait FetchStatusStore: Send + Sync {
    /// Current status, creating a `not_fetched` record on first access.
    async fn get_status(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchStatus, StoreError>;

    /// Full record, creating it on first access.
    async fn get_record(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchRecord, StoreError>;

    /// Atomically move the record to `fetching` if its status admits a fetch
    /// (see [`FetchStatus::admits_fetch`]). Returns `false` without changing
    /// anything otherwise.
    async fn try_begin_fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        force: bool,
    ) -> Result<bool, StoreError>;

    /// Finish an admitted fetch: `fetching -> outcome`, `attempt_count + 1`.
    ///
    /// Fails with [`StoreError::InvalidTransition`] if the record is not
    /// `fetching`.
    async fn complete_fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        outcome: CompletionOutcome,
    ) -> Result<FetchRecord, StoreError>;

    /// Give an admitted fetch back without counting an attempt: `fetching`
    /// returns to `not_fetched` if nothing was ever attempted, else to
    /// `error` with the previous `last_error` kept.
    async fn release_fetch(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchRecord, StoreError>;

    /// Move every record that has been `fetching` for longer than
    /// `older_than` to `error`, counting the lost attempt. Returns the keys
    /// that were reset.
    async fn reset_stale(&self, older_than: Duration) -> Result<Vec<EntityKey>, StoreError>;
}

/// Status a released fetch falls back to.
pub(crate) fn released_status(attempt_count: u32) -> FetchStatus {
    if attempt_count == 0 {
        FetchStatus::NotFetched
    } else {
        FetchStatus::Error
    }
}

/// Every status `try_begin_fetch` may start from.
pub(crate) fn admitting_statuses(force: bool) -> Vec<FetchStatus> {
    [
        FetchStatus::NotFetched,
        FetchStatus::Fetching,
        FetchStatus::Fetched,
        FetchStatus::NotFound,
        FetchStatus::Error,
    ]
    .into_iter()
    .filter(|s| s.admits_fetch(force))
    .collect()
}
