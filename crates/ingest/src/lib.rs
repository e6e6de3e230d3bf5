pub mod client;
pub mod dead_letter;
pub mod error;
pub mod model;
pub mod rate_limit;
pub mod reconciler;
pub mod scheduler;
pub mod sink;
pub mod status;

pub use client::{ApiFetchClient, FetchClient, FetchOutcome, OsuApiClient, OsuTrackClient};
pub use dead_letter::{dead_letter_keys, report_dead_letter};
pub use error::{ClientError, IngestError, RateLimitError, StoreError};
pub use model::{
    completion_route, request_route, FetchCompleted, FetchContext, FetchRequest, FetchedEntity,
};
pub use rate_limit::RateLimiter;
pub use reconciler::StaleFetchReconciler;
pub use scheduler::{backoff_delay, Disposition, IngestionScheduler, SchedulerSettings};
pub use sink::{EntitySink, MemoryEntitySink, PgEntitySink};
pub use status::{
    CompletionOutcome, FetchRecord, FetchStatusStore, MemoryFetchStatusStore, PgFetchStatusStore,
};
