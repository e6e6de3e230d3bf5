//! Typed publishing on top of a raw [`QueueSender`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::envelope::{DeadLetter, Envelope, MessageMetadata};
use crate::error::EisenbahnError;
use crate::routes::{QueueRoute, RouteTable};
use crate::traits::QueueSender;

/// Upper bound on concurrently running publishes. `close` drains by
/// acquiring all of them at once.
const MAX_IN_FLIGHT: u32 = 1 << 16;

/// Per-call overrides for [`Publisher::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Use this metadata instead of fresh metadata. Used to carry a
    /// correlation id and retry count across a job.
    pub metadata: Option<MessageMetadata>,
    /// Hide the message from consumers for this long.
    pub delay: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

struct PublisherInner {
    sender: Arc<dyn QueueSender>,
    routes: RouteTable,
    gate: Semaphore,
    closing: AtomicBool,
}

impl PublisherInner {
    async fn drain_and_shutdown(&self) -> Result<(), EisenbahnError> {
        self.closing.store(true, Ordering::SeqCst);
        match self.gate.acquire_many(MAX_IN_FLIGHT).await {
            Ok(permits) => {
                // Every in-flight publish has returned; nothing can start now.
                permits.forget();
                self.gate.close();
                info!("publisher drained, releasing transport");
                self.sender.shutdown().await
            }
            // Another close already finished.
            Err(_) => Ok(()),
        }
    }
}

/// Wraps payloads in [`Envelope`]s and sends them to their routes.
///
/// Cloning is cheap; clones share the transport and the close state.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(sender: Arc<dyn QueueSender>, routes: RouteTable) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                sender,
                routes,
                gate: Semaphore::new(MAX_IN_FLIGHT as usize),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Publish `payload` to `route` and return the envelope that was sent.
    pub async fn publish<T: Serialize>(
        &self,
        route: QueueRoute,
        payload: T,
        options: PublishOptions,
    ) -> Result<Envelope<T>, EisenbahnError> {
        let key = self.inner.routes.key(route);
        self.send_envelope(key, payload, options).await
    }

    /// Send `original` to the dead-letter destination of `route`.
    pub async fn dead_letter<T: Serialize>(
        &self,
        route: QueueRoute,
        original: T,
        metadata: &MessageMetadata,
        reason: impl Into<String>,
    ) -> Result<Envelope<DeadLetter<T>>, EisenbahnError> {
        let key = self.inner.routes.dead_letter_key(route).ok_or_else(|| {
            EisenbahnError::Config(format!("route '{route}' has no dead-letter destination"))
        })?;
        let letter = DeadLetter {
            original,
            reason: reason.into(),
            source: self.inner.routes.key(route).to_string(),
            failed_at: Utc::now(),
        };
        let options = PublishOptions::new().metadata(metadata.continuation());
        self.send_envelope(key, letter, options).await
    }

    async fn send_envelope<T: Serialize>(
        &self,
        key: &'static str,
        payload: T,
        options: PublishOptions,
    ) -> Result<Envelope<T>, EisenbahnError> {
        if self.is_closed() {
            return Err(EisenbahnError::Closed);
        }
        let _permit = self
            .inner
            .gate
            .acquire()
            .await
            .map_err(|_| EisenbahnError::Closed)?;

        let metadata = options.metadata.unwrap_or_default();
        let envelope = Envelope::with_metadata(key, payload, metadata);
        let bytes = envelope.to_bytes()?;
        self.inner.sender.send(key, bytes, options.delay).await?;

        debug!(
            routing_key = key,
            correlation_id = %envelope.metadata.correlation_id,
            retry_count = envelope.metadata.retry_count,
            "published envelope"
        );
        Ok(envelope)
    }

    /// Stop accepting publishes, wait for in-flight ones to be handed to the
    /// transport, then release it.
    ///
    /// The drain runs on its own task, so dropping the returned future does
    /// not abandon it halfway. Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<(), EisenbahnError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drain_and_shutdown().await })
            .await
            .map_err(|e| EisenbahnError::Transport(format!("publisher close task failed: {e}")))?
    }
}
