pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod publisher;
pub mod routes;
pub mod traits;
pub mod transport;
pub mod worker;

pub use config::{EisenbahnConfig, RouteConfig, SocketKind, TransportConfig, TransportKind};
pub use consumer::QueueMessage;
pub use envelope::{DeadLetter, Envelope, MessageMetadata};
pub use error::EisenbahnError;
pub use memory::{LocalQueue, MemoryBroker};
pub use pipeline::{ZmqQueueConsumer, ZmqQueueSender};
pub use publisher::{PublishOptions, Publisher};
pub use routes::{QueueGroup, QueueRoute, RouteDef, RouteTable};
pub use traits::{QueueConsumer, QueueSender};
pub use transport::Transport;
pub use worker::{ConsumerBinding, MessageHandler, Worker, WorkerBuilder, WorkerRunner, WorkerRunnerConfig};
