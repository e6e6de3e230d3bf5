//! Reporting for requests that were given up.
//!
//! Dead letters are the operator-facing end of the pipeline. The worker
//! can drain the `*.dead-letter` queues itself, writing each letter to the
//! log at `warn`, or leave them bound elsewhere.

use tracing::{error, warn};

use otr_core::EntityKind;
use otr_eisenbahn::{DeadLetter, Envelope, QueueMessage, RouteTable};

use crate::model::{request_route, FetchRequest};

/// Dead-letter keys of every request route.
pub fn dead_letter_keys(routes: &RouteTable) -> Vec<&'static str> {
    EntityKind::ALL
        .iter()
        .filter_map(|kind| routes.dead_letter_key(request_route(*kind)))
        .collect()
}

/// Log a dead-lettered fetch request. Returns the decoded letter, or
/// `None` when the body is not one.
pub fn report_dead_letter(message: &QueueMessage) -> Option<Envelope<DeadLetter<FetchRequest>>> {
    let envelope: Envelope<DeadLetter<FetchRequest>> = match message.decode() {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(
                routing_key = %message.routing_key,
                message_id = %message.id,
                error = %e,
                "undecodable dead letter, dropping"
            );
            return None;
        }
    };
    let letter = &envelope.payload;
    warn!(
        kind = %letter.original.kind,
        external_id = letter.original.external_id,
        source = %letter.source,
        correlation_id = %envelope.correlation_id(),
        retry_count = envelope.retry_count(),
        failed_at = %letter.failed_at,
        reason = %letter.reason,
        "fetch request dead-lettered"
    );
    Some(envelope)
}
