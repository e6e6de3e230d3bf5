use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::consumer::QueueMessage;
use crate::error::EisenbahnError;

/// Hands encoded envelopes to a transport.
///
/// This is the raw side of [`crate::Publisher`]: it knows nothing about
/// payload types or routes, only wire keys and bytes.
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// Enqueue `body` on `routing_key`. With a `delay`, the message must not
    /// be delivered to a consumer before it elapses.
    async fn send(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        delay: Option<Duration>,
    ) -> Result<(), EisenbahnError>;

    /// Release the underlying connection. Called once by [`crate::Publisher::close`]
    /// after all in-flight sends have returned.
    async fn shutdown(&self) -> Result<(), EisenbahnError> {
        Ok(())
    }
}

/// Blanket implementation so `Arc<dyn QueueSender>` can be used directly.
#[async_trait]
impl<T: QueueSender + ?Sized> QueueSender for Arc<T> {
    async fn send(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        delay: Option<Duration>,
    ) -> Result<(), EisenbahnError> {
        (**self).send(routing_key, body, delay).await
    }

    async fn shutdown(&self) -> Result<(), EisenbahnError> {
        (**self).shutdown().await
    }
}

/// Pulls messages from one queue with at-least-once semantics.
///
/// A received message stays in flight until it is acked. A nacked message
/// is redelivered, so handlers must be idempotent.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Routing key this consumer reads from.
    fn routing_key(&self) -> &str;

    /// Wait for the next message. Returns `None` once the queue is closed.
    async fn recv(&self) -> Result<Option<QueueMessage>, EisenbahnError>;

    /// Acknowledge successful processing. The message will not be redelivered.
    async fn ack(&self, receipt_handle: &str) -> Result<(), EisenbahnError>;

    /// Return the message to the queue for redelivery.
    async fn nack(&self, receipt_handle: &str) -> Result<(), EisenbahnError>;
}

#[async_trait]
impl<T: QueueConsumer + ?Sized> QueueConsumer for Arc<T> {
    fn routing_key(&self) -> &str {
        (**self).routing_key()
    }

    async fn recv(&self) -> Result<Option<QueueMessage>, EisenbahnError> {
        (**self).recv().await
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), EisenbahnError> {
        (**self).ack(receipt_handle).await
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), EisenbahnError> {
        (**self).nack(receipt_handle).await
    }
}
