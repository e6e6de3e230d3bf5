//! ZeroMQ PUSH/PULL transport for queue routes.
//!
//! Every routing key maps to one endpoint. Producers PUSH to it, the
//! consuming worker binds a PULL socket there. Messages travel as three
//! frames: `[routing_key, deliver_at_ms, envelope]`, where `deliver_at_ms`
//! is a big-endian Unix timestamp (0 = deliver immediately).
//!
//! ZeroMQ has no broker-side acknowledgement. Received messages are kept in
//! a [`LocalQueue`], so ack/nack and delayed delivery behave as with the
//! in-memory broker, but unacked messages do not survive a restart. The
//! fetch-status reconciler is what recovers work lost that way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use zeromq::{PullSocket, PushSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::consumer::QueueMessage;
use crate::error::EisenbahnError;
use crate::memory::LocalQueue;
use crate::traits::{QueueConsumer, QueueSender};
use crate::transport::Transport;

/// Build the three-frame wire message.
fn encode_frames(routing_key: &str, body: Vec<u8>, delay: Option<Duration>) -> ZmqMessage {
    let deliver_at_ms = match delay.filter(|d| !d.is_zero()) {
        Some(d) => Utc::now().timestamp_millis() + d.as_millis() as i64,
        None => 0,
    };
    let mut msg = ZmqMessage::from(routing_key);
    msg.push_back(deliver_at_ms.to_be_bytes().to_vec().into());
    msg.push_back(body.into());
    msg
}

/// Split a wire message into `(routing_key, body, remaining delay)`.
fn decode_frames(msg: &ZmqMessage) -> Result<(String, Vec<u8>, Option<Duration>), EisenbahnError> {
    let frames: Vec<_> = msg.iter().collect();
    if frames.len() != 3 {
        return Err(EisenbahnError::Transport(format!(
            "expected 3 frames, got {}",
            frames.len()
        )));
    }
    let routing_key = String::from_utf8(frames[0].to_vec())
        .map_err(|_| EisenbahnError::Transport("routing key frame is not UTF-8".into()))?;
    let deliver_at = <[u8; 8]>::try_from(&frames[1][..])
        .map_err(|_| EisenbahnError::Transport("deliver_at frame must be 8 bytes".into()))?;
    let deliver_at_ms = i64::from_be_bytes(deliver_at);
    let remaining = deliver_at_ms - Utc::now().timestamp_millis();
    let delay = (deliver_at_ms > 0 && remaining > 0).then(|| Duration::from_millis(remaining as u64));
    Ok((routing_key, frames[2].to_vec(), delay))
}

/// How long a PUSH socket may wait for the PULL side before a send fails.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct PushSlot {
    transport: Transport,
    socket: Option<PushSocket>,
}

/// PUSH sockets, one per routing key, connected to the consuming workers.
///
/// Sockets connect on the first send to their key, so a route whose
/// consumer is not running only fails the publishes that target it.
pub struct ZmqQueueSender {
    slots: HashMap<String, Mutex<PushSlot>>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl ZmqQueueSender {
    pub fn new(endpoints: &HashMap<String, Transport>) -> Self {
        let slots = endpoints
            .iter()
            .map(|(key, transport)| {
                let slot = PushSlot {
                    transport: transport.clone(),
                    socket: None,
                };
                (key.clone(), Mutex::new(slot))
            })
            .collect();
        Self {
            slots,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// PUSH sockets connect (not bind) because the PULL side is the stable
    /// worker endpoint.
    #[instrument(skip_all, fields(routing_key = %routing_key, endpoint = %transport))]
    async fn connect(
        routing_key: &str,
        transport: &Transport,
        timeout: Duration,
    ) -> Result<PushSocket, EisenbahnError> {
        let mut socket = PushSocket::new();
        match tokio::time::timeout(timeout, socket.connect(&transport.endpoint())).await {
            Ok(Ok(())) => {
                info!("PUSH socket connected");
                Ok(socket)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(EisenbahnError::Transport(format!(
                "no consumer listening for '{routing_key}' on {transport} after {timeout:?}"
            ))),
        }
    }
}

#[async_trait]
impl QueueSender for ZmqQueueSender {
    async fn send(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        delay: Option<Duration>,
    ) -> Result<(), EisenbahnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EisenbahnError::Closed);
        }
        let slot = self
            .slots
            .get(routing_key)
            .ok_or_else(|| EisenbahnError::UnknownRoutingKey(routing_key.to_string()))?;
        let mut guard = slot.lock().await;
        let slot = &mut *guard;
        let socket = match &mut slot.socket {
            Some(socket) => socket,
            empty => {
                let socket = Self::connect(routing_key, &slot.transport, self.connect_timeout).await?;
                empty.insert(socket)
            }
        };
        if let Err(e) = socket.send(encode_frames(routing_key, body, delay)).await {
            // Reconnect on the next send.
            slot.socket = None;
            return Err(e.into());
        }
        debug!(routing_key, "pushed message");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EisenbahnError> {
        self.closed.store(true, Ordering::Release);
        for (routing_key, slot) in &self.slots {
            if slot.lock().await.socket.take().is_some() {
                debug!(routing_key = %routing_key, "PUSH socket released");
            }
        }
        Ok(())
    }
}

/// PULL socket bound on a route's endpoint, buffering into a [`LocalQueue`].
pub struct ZmqQueueConsumer {
    queue: Arc<LocalQueue>,
    reader: JoinHandle<()>,
}

impl ZmqQueueConsumer {
    #[instrument(skip_all, fields(routing_key = %routing_key, endpoint = %transport))]
    pub async fn bind(routing_key: &str, transport: &Transport) -> Result<Self, EisenbahnError> {
        transport.prepare_bind()?;
        let mut socket = PullSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding PULL socket");
        socket.bind(&endpoint).await?;

        let queue = Arc::new(LocalQueue::new(routing_key));
        let reader = tokio::spawn(Self::read_loop(socket, queue.clone()));
        Ok(Self { queue, reader })
    }

    async fn read_loop(mut socket: PullSocket, queue: Arc<LocalQueue>) {
        loop {
            match socket.recv().await {
                Ok(raw) => match decode_frames(&raw) {
                    Ok((key, body, delay)) => {
                        if key != queue.routing_key() {
                            warn!(expected = %queue.routing_key(), got = %key, "message for another route on this endpoint");
                        }
                        queue.push(body, delay);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed ZMQ message"),
                },
                Err(e) => {
                    warn!(error = %e, routing_key = %queue.routing_key(), "PULL socket failed, closing queue");
                    queue.close();
                    break;
                }
            }
        }
    }

    /// The local delivery buffer, for inspection.
    pub fn queue(&self) -> &Arc<LocalQueue> {
        &self.queue
    }
}

impl Drop for ZmqQueueConsumer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl QueueConsumer for ZmqQueueConsumer {
    fn routing_key(&self) -> &str {
        self.queue.routing_key()
    }

    async fn recv(&self) -> Result<Option<QueueMessage>, EisenbahnError> {
        self.queue.recv().await
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), EisenbahnError> {
        self.queue.ack(receipt_handle).await
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), EisenbahnError> {
        self.queue.nack(receipt_handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn frames_roundtrip_without_delay() {
        let msg = encode_frames("data.osu.players", b"payload".to_vec(), None);
        let (key, body, delay) = decode_frames(&msg).unwrap();
        assert_eq!(key, "data.osu.players");
        assert_eq!(body, b"payload");
        assert!(delay.is_none());
    }

    #[test]
    fn frames_carry_remaining_delay() {
        let msg = encode_frames("data.osu.players", vec![], Some(Duration::from_secs(60)));
        let (_, _, delay) = decode_frames(&msg).unwrap();
        let delay = delay.expect("delay should survive the wire");
        assert!(delay > Duration::from_secs(55) && delay <= Duration::from_secs(60));
    }

    #[test]
    fn rejects_wrong_frame_count() {
        let msg = ZmqMessage::from("only-one-frame");
        assert!(decode_frames(&msg).is_err());
    }

    #[tokio::test]
    async fn push_pull_roundtrip_with_ack() {
        let transport = Transport::tcp("127.0.0.1", 15610);
        let consumer = ZmqQueueConsumer::bind("data.osu.players", &transport).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let endpoints = HashMap::from([("data.osu.players".to_string(), transport.clone())]);
        let sender = ZmqQueueSender::new(&endpoints);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let env = Envelope::new("data.osu.players", 4242i64);
        sender
            .send("data.osu.players", env.to_bytes().unwrap(), None)
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), consumer.recv())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        let received: Envelope<i64> = msg.decode().unwrap();
        assert_eq!(received.payload, 4242);
        assert_eq!(received.correlation_id(), env.correlation_id());
        consumer.ack(&msg.receipt_handle).await.unwrap();
        assert_eq!(consumer.queue().in_flight_len(), 0);
    }

    #[tokio::test]
    async fn send_to_unknown_route_fails() {
        let sender = ZmqQueueSender::new(&HashMap::new());
        let err = sender.send("data.osu.matches", vec![], None).await.unwrap_err();
        assert!(matches!(err, EisenbahnError::UnknownRoutingKey(_)));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_refused() {
        let transport = Transport::tcp("127.0.0.1", 15611);
        let _consumer = ZmqQueueConsumer::bind("data.osu.beatmaps", &transport).await.unwrap();
        let endpoints = HashMap::from([("data.osu.beatmaps".to_string(), transport)]);
        let sender = ZmqQueueSender::new(&endpoints);

        sender.shutdown().await.unwrap();
        let err = sender.send("data.osu.beatmaps", vec![], None).await.unwrap_err();
        assert!(matches!(err, EisenbahnError::Closed));
    }

    #[tokio::test]
    async fn route_without_consumer_fails_only_its_own_sends() {
        let bound = Transport::tcp("127.0.0.1", 15612);
        let consumer = ZmqQueueConsumer::bind("data.osu.players", &bound).await.unwrap();
        let endpoints = HashMap::from([
            ("data.osu.players".to_string(), bound),
            ("data.osu.players.dead-letter".to_string(), Transport::tcp("127.0.0.1", 15613)),
        ]);
        let sender = ZmqQueueSender::new(&endpoints).connect_timeout(Duration::from_millis(300));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            sender.send("data.osu.players.dead-letter", vec![], None),
        )
        .await
        .expect("send must not hang")
        .unwrap_err();
        assert!(matches!(err, EisenbahnError::Transport(_) | EisenbahnError::Zmq(_)), "{err}");

        let env = Envelope::new("data.osu.players", 7i64);
        sender.send("data.osu.players", env.to_bytes().unwrap(), None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), consumer.recv())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        assert_eq!(msg.decode::<i64>().unwrap().payload, 7);
    }
}
