//! Per-message ingestion flow.
//!
//! decode -> admit -> rate permit -> fetch -> handle outcome. Admission
//! through [`FetchStatusStore::try_begin_fetch`] is what keeps redelivered
//! and duplicate requests from fetching twice; everything after it runs
//! only for the single admitted delivery.
//!
//! `Ok` from [`IngestionScheduler::handle`] means the message may be
//! acknowledged. `Err` means storage or the queue failed and the message
//! must be redelivered.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use otr_core::config::IngestSettings;
use otr_eisenbahn::{EisenbahnError, Envelope, PublishOptions, Publisher, QueueMessage};

use crate::client::{FetchClient, FetchOutcome};
use crate::error::{IngestError, StoreError};
use crate::model::{completion_route, request_route, FetchCompleted, FetchRequest};
use crate::rate_limit::RateLimiter;
use crate::sink::EntitySink;
use crate::status::{CompletionOutcome, FetchStatusStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Attempts (counted by the status store) before a transient failure
    /// is dead-lettered.
    pub max_retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&IngestSettings> for SchedulerSettings {
    fn from(settings: &IngestSettings) -> Self {
        Self {
            max_retry_attempts: settings.max_retry_attempts,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&IngestSettings::default())
    }
}

/// `base * 2^retry_count`, capped at `max`.
pub fn backoff_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(retry_count)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// What happened to a handled message. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Already fetched or being fetched elsewhere.
    Skipped,
    Completed,
    NotFound,
    /// Re-published with `retry_count + 1`.
    Requeued { delay: Duration },
    DeadLettered,
    /// Undecodable body.
    Dropped,
}

pub struct IngestionScheduler {
    store: Arc<dyn FetchStatusStore>,
    limiter: Arc<RateLimiter>,
    client: Arc<dyn FetchClient>,
    sink: Arc<dyn EntitySink>,
    publisher: Publisher,
    settings: SchedulerSettings,
}

impl IngestionScheduler {
    pub fn new(
        store: Arc<dyn FetchStatusStore>,
        limiter: Arc<RateLimiter>,
        client: Arc<dyn FetchClient>,
        sink: Arc<dyn EntitySink>,
        publisher: Publisher,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            limiter,
            client,
            sink,
            publisher,
            settings,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Adapter for [`otr_eisenbahn::WorkerBuilder::on_message`].
    pub async fn handle_message(&self, message: QueueMessage) -> Result<(), EisenbahnError> {
        match self.handle(&message).await {
            Ok(disposition) => {
                debug!(message_id = %message.id, ?disposition, "message handled");
                Ok(())
            }
            Err(e) => Err(EisenbahnError::Handler(e.to_string())),
        }
    }

    pub async fn handle(&self, message: &QueueMessage) -> Result<Disposition, IngestError> {
        let envelope: Envelope<FetchRequest> = match message.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                // Redelivering a poison message would never succeed.
                error!(
                    routing_key = %message.routing_key,
                    message_id = %message.id,
                    error = %e,
                    "undecodable fetch request, dropping"
                );
                return Ok(Disposition::Dropped);
            }
        };
        let request = &envelope.payload;

        if !self
            .store
            .try_begin_fetch(request.kind, request.external_id, request.force)
            .await?
        {
            debug!(
                kind = %request.kind,
                external_id = request.external_id,
                correlation_id = %envelope.correlation_id(),
                "not admitted, skipping"
            );
            return Ok(Disposition::Skipped);
        }

        match self.run_admitted(&envelope).await {
            Ok(disposition) => Ok(disposition),
            Err(e) => {
                self.release_after_failure(request).await;
                Err(e)
            }
        }
    }

    async fn run_admitted(&self, envelope: &Envelope<FetchRequest>) -> Result<Disposition, IngestError> {
        let request = &envelope.payload;
        let (kind, external_id) = (request.kind, request.external_id);
        let correlation_id = envelope.correlation_id();

        self.limiter.acquire(kind.api()).await;
        let outcome = self.client.fetch(kind, external_id, request.context.as_ref()).await;
        debug!(%kind, external_id, %correlation_id, outcome = outcome.label(), "fetch finished");

        match outcome {
            FetchOutcome::Success(mut entity) => {
                if let Some(context) = &request.context {
                    entity.resolve_rulesets(context.tournament_ruleset);
                }
                self.sink.persist(kind, external_id, &entity).await?;

                let completed = FetchCompleted {
                    kind,
                    external_id,
                    tournament_id: request.context.map(|c| c.tournament_id),
                    resolved_data: entity,
                };
                self.publisher
                    .publish(
                        completion_route(kind),
                        completed,
                        PublishOptions::new().metadata(envelope.metadata.continuation()),
                    )
                    .await?;

                self.store
                    .complete_fetch(kind, external_id, CompletionOutcome::Fetched)
                    .await?;
                info!(%kind, external_id, %correlation_id, "entity fetched");
                Ok(Disposition::Completed)
            }

            FetchOutcome::NotFound => {
                self.store
                    .complete_fetch(kind, external_id, CompletionOutcome::NotFound)
                    .await?;
                info!(%kind, external_id, %correlation_id, "entity not found upstream");
                Ok(Disposition::NotFound)
            }

            FetchOutcome::RateLimited { retry_after } => {
                // Upstream refused before doing any work: not an attempt.
                self.store.release_fetch(kind, external_id).await?;
                let delay = self
                    .backoff(envelope.retry_count())
                    .max(retry_after.unwrap_or_default());
                warn!(%kind, external_id, %correlation_id, delay_ms = delay.as_millis() as u64, "rate limited upstream, requeueing");
                self.requeue(envelope, delay).await?;
                Ok(Disposition::Requeued { delay })
            }

            FetchOutcome::TransientError(cause) => {
                let record = self
                    .store
                    .complete_fetch(kind, external_id, CompletionOutcome::Error(cause.clone()))
                    .await?;
                if record.attempt_count < self.settings.max_retry_attempts {
                    let delay = self.backoff(envelope.retry_count());
                    warn!(
                        %kind, external_id, %correlation_id,
                        attempt = record.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "transient fetch failure, requeueing"
                    );
                    self.requeue(envelope, delay).await?;
                    Ok(Disposition::Requeued { delay })
                } else {
                    let reason = format!("gave up after {} attempts: {cause}", record.attempt_count);
                    self.dead_letter(envelope, reason).await?;
                    Ok(Disposition::DeadLettered)
                }
            }

            FetchOutcome::PermanentError(cause) => {
                self.store
                    .complete_fetch(kind, external_id, CompletionOutcome::Error(cause.clone()))
                    .await?;
                self.dead_letter(envelope, cause).await?;
                Ok(Disposition::DeadLettered)
            }
        }
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        backoff_delay(retry_count, self.settings.backoff_base, self.settings.backoff_max)
    }

    async fn requeue(&self, envelope: &Envelope<FetchRequest>, delay: Duration) -> Result<(), IngestError> {
        self.publisher
            .publish(
                request_route(envelope.payload.kind),
                envelope.payload.clone(),
                PublishOptions::new()
                    .metadata(envelope.metadata.next_retry())
                    .delay(delay),
            )
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, envelope: &Envelope<FetchRequest>, reason: String) -> Result<(), IngestError> {
        let request = &envelope.payload;
        warn!(
            kind = %request.kind,
            external_id = request.external_id,
            correlation_id = %envelope.correlation_id(),
            %reason,
            "dead-lettering fetch request"
        );
        self.publisher
            .dead_letter(request_route(request.kind), request.clone(), &envelope.metadata, reason)
            .await?;
        Ok(())
    }

    /// Hand the record back so the redelivered message can be admitted.
    /// If the store is down too, the stale-fetch reconciler recovers it.
    async fn release_after_failure(&self, request: &FetchRequest) {
        match self.store.release_fetch(request.kind, request.external_id).await {
            Ok(_) => {}
            // Status already moved past `fetching` before the failure.
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => warn!(
                kind = %request.kind,
                external_id = request.external_id,
                error = %e,
                "could not release fetch after failure"
            ),
        }
    }
}
