use otr_core::{CoreError, EntityKey, ExternalApi, FetchStatus};
use otr_eisenbahn::EisenbahnError;
use thiserror::Error;

/// Failures of the fetch-status store or the entity sink.
///
/// Every variant is a storage error from the scheduler's point of view: the
/// message being handled is not acknowledged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: EntityKey,
        from: FetchStatus,
        to: FetchStatus,
    },

    #[error("no status record for {0}")]
    MissingRecord(EntityKey),

    #[error("corrupt row: {0}")]
    Corrupt(#[from] CoreError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("requests_per_minute for '{api}' must be > 0, got {rate}")]
    InvalidRate { api: ExternalApi, rate: i64 },

    #[error("rate window must be at least one nanosecond per permit, got {0:?}")]
    InvalidWindow(std::time::Duration),
}

/// Errors building a fetch client. Errors during a fetch are classified
/// into a [`crate::client::FetchOutcome`] instead.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("client configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] EisenbahnError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("config error: {0}")]
    Config(#[from] CoreError),
}
