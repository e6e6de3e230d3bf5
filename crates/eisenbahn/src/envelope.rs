use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cross-cutting metadata carried by every envelope.
///
/// `correlation_id` is copied unchanged across every stage of one ingestion
/// job. `retry_count` starts at 0 and is only bumped by a consumer that
/// re-publishes a request after a recoverable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// When this envelope was created.
    pub timestamp: DateTime<Utc>,

    /// Number of times this request has been re-published.
    #[serde(default)]
    pub retry_count: u32,

    /// Correlation ID for end-to-end tracing of one ingestion job.
    pub correlation_id: Uuid,
}

impl MessageMetadata {
    /// Fresh metadata for the first message of a new job.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Metadata for a re-publish of the same job: same correlation id,
    /// retry count incremented, timestamp refreshed.
    pub fn next_retry(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            retry_count: self.retry_count + 1,
            correlation_id: self.correlation_id,
        }
    }

    /// Metadata for a follow-up message in the same job (downstream event,
    /// dead letter). The retry counter belongs to the request, so it resets.
    pub fn continuation(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id: self.correlation_id,
        }
    }
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-format envelope for inter-stage communication.
///
/// Envelopes are serialized with MessagePack for compact, fast transport.
/// `routing_key` is the resolved queue destination (see [`crate::routes`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Resolved destination, e.g. `data.osu.players`.
    pub routing_key: String,

    pub payload: T,

    pub metadata: MessageMetadata,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

/// Default version for envelopes that omit the field (backward compat).
fn default_version() -> u16 {
    1
}

impl<T> Envelope<T> {
    pub fn new(routing_key: impl Into<String>, payload: T) -> Self {
        Self::with_metadata(routing_key, payload, MessageMetadata::new())
    }

    pub fn with_metadata(routing_key: impl Into<String>, payload: T, metadata: MessageMetadata) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            metadata,
            version: 1,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.metadata.correlation_id
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize this entire envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Payload written to a dead-letter destination: the original payload plus
/// why it was given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter<T> {
    pub original: T,
    pub reason: String,
    /// Routing key the original was consumed from.
    pub source: String,
    pub failed_at: DateTime<Utc>,
}
