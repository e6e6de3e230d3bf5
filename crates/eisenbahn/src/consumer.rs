//! Raw queue deliveries.

use serde::de::DeserializeOwned;

use crate::envelope::Envelope;
use crate::error::EisenbahnError;

/// A raw message received from a queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Transport-assigned message identifier, stable across redeliveries.
    pub id: String,
    /// Queue the message was received from.
    pub routing_key: String,
    /// MessagePack-encoded [`Envelope`].
    pub body: Vec<u8>,
    /// Handle for ack/nack. Unique per delivery.
    pub receipt_handle: String,
    /// Number of times this message has been delivered, including this one.
    pub delivery_count: u32,
}

impl QueueMessage {
    /// Decode the body into a typed envelope.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Envelope<T>, EisenbahnError> {
        Ok(Envelope::from_bytes(&self.body)?)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
