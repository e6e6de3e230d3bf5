use thiserror::Error;

/// Errors that can occur in the eisenbahn messaging layer.
#[derive(Debug, Error)]
pub enum EisenbahnError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("publisher is closed")]
    Closed,

    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("no queue for routing key '{0}'")]
    UnknownRoutingKey(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("handler error: {0}")]
    Handler(String),
}
