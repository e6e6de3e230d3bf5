use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EisenbahnError;
use crate::routes::RouteTable;
use crate::transport::Transport;

// ── Top-level config ────────────────────────────────────────────────

/// Configuration for the queue layer.
///
/// Parsed from `eisenbahn.toml` with support for environment variable overrides.
///
/// ```toml
/// [transport]
/// kind = "zmq"
/// socket = "tcp"
/// default_host = "10.0.0.4"
/// base_port = 5600
///
/// [routes."data.osu.players"]
/// concurrency = 4
///
/// [routes."data.osu.matches"]
/// endpoint = "tcp://10.0.0.7:5700"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EisenbahnConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    /// Per routing key settings. Keys must exist in the route table.
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Which queue implementation carries messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process [`crate::MemoryBroker`]. Single process only.
    #[default]
    Memory,
    /// ZeroMQ PUSH/PULL, one endpoint per routing key.
    Zmq,
}

impl std::str::FromStr for TransportKind {
    type Err = EisenbahnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "zmq" => Ok(Self::Zmq),
            other => Err(EisenbahnError::Config(format!(
                "invalid transport kind '{other}', expected 'memory' or 'zmq'"
            ))),
        }
    }
}

/// Socket family used for auto-assigned ZeroMQ endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketKind {
    #[default]
    Ipc,
    Tcp,
}

/// Transport defaults section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,

    /// Socket family for routes without an explicit `endpoint`.
    #[serde(default)]
    pub socket: SocketKind,

    /// Default TCP host (used when socket = "tcp").
    #[serde(default = "default_tcp_host")]
    pub default_host: String,

    /// Base port for auto-assigned TCP endpoints.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

fn default_tcp_host() -> String {
    "127.0.0.1".into()
}

fn default_base_port() -> u16 {
    5600
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            socket: SocketKind::default(),
            default_host: default_tcp_host(),
            base_port: default_base_port(),
        }
    }
}

/// Settings for a single routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Explicit ZeroMQ endpoint (`ipc://…` or `tcp://host:port`).
    pub endpoint: Option<String>,

    /// Number of parallel consumer loops for this queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            concurrency: default_concurrency(),
        }
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl EisenbahnConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, EisenbahnError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EisenbahnError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Single-process deployment on the in-memory broker.
    pub fn local() -> Self {
        Self::default()
    }

    /// Settings for `routing_key`, falling back to defaults.
    pub fn route(&self, routing_key: &str) -> RouteConfig {
        self.routes.get(routing_key).cloned().unwrap_or_default()
    }

    pub fn concurrency(&self, routing_key: &str) -> usize {
        self.route(routing_key).concurrency as usize
    }

    /// Resolve the ZeroMQ endpoint for `routing_key`.
    ///
    /// An explicit `endpoint` wins. Otherwise IPC sockets are named after the
    /// key, and TCP ports are assigned from `base_port` in key order.
    pub fn endpoint_for(&self, routing_key: &str, table: &RouteTable) -> Result<Transport, EisenbahnError> {
        if let Some(endpoint) = self.routes.get(routing_key).and_then(|r| r.endpoint.as_deref()) {
            return Transport::parse(endpoint);
        }
        match self.transport.socket {
            SocketKind::Ipc => Ok(Transport::ipc(&routing_key.replace('.', "-"))),
            SocketKind::Tcp => {
                let index = table
                    .all_keys()
                    .iter()
                    .position(|k| *k == routing_key)
                    .ok_or_else(|| EisenbahnError::UnknownRoutingKey(routing_key.to_string()))?;
                let port = self
                    .transport
                    .base_port
                    .checked_add(index as u16)
                    .ok_or_else(|| EisenbahnError::Config("TCP port range overflows u16".into()))?;
                Ok(Transport::tcp(self.transport.default_host.clone(), port))
            }
        }
    }

    /// Endpoints for every key in `table`, dead-letter keys included.
    pub fn endpoints(&self, table: &RouteTable) -> Result<HashMap<String, Transport>, EisenbahnError> {
        table
            .all_keys()
            .into_iter()
            .map(|key| Ok((key.to_string(), self.endpoint_for(key, table)?)))
            .collect()
    }

    /// Validate against the standard route table.
    pub fn validate(&self) -> Result<(), EisenbahnError> {
        self.validate_against(&RouteTable::standard())
    }

    pub fn validate_against(&self, table: &RouteTable) -> Result<(), EisenbahnError> {
        let known = table.all_keys();
        for (key, route) in &self.routes {
            if !known.contains(&key.as_str()) {
                return Err(EisenbahnError::Config(format!(
                    "route section '{key}' does not name a known routing key"
                )));
            }
            if route.concurrency == 0 {
                return Err(EisenbahnError::Config(format!(
                    "route '{key}' has concurrency 0"
                )));
            }
            if let Some(endpoint) = &route.endpoint {
                Transport::parse(endpoint)?;
            }
        }
        if self.transport.kind == TransportKind::Zmq {
            // Two routes sharing an endpoint would mix their messages.
            let endpoints = self.endpoints(table)?;
            let mut seen: HashMap<String, &str> = HashMap::new();
            for (key, transport) in &endpoints {
                if let Some(other) = seen.insert(transport.endpoint(), key) {
                    return Err(EisenbahnError::Config(format!(
                        "routes '{other}' and '{key}' share endpoint {transport}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply `EISENBAHN_*` environment variable overrides.
    fn apply_env_overrides(&mut self) -> Result<(), EisenbahnError> {
        if let Ok(v) = std::env::var("EISENBAHN_TRANSPORT_KIND") {
            self.transport.kind = v.parse()?;
        }
        if let Ok(v) = std::env::var("EISENBAHN_TRANSPORT_DEFAULT_HOST") {
            self.transport.default_host = v;
        }
        if let Ok(v) = std::env::var("EISENBAHN_TRANSPORT_BASE_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.transport.base_port = port;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_local_memory() {
        let config = EisenbahnConfig::from_toml("").unwrap();
        assert_eq!(config.transport.kind, TransportKind::Memory);
        assert_eq!(config.concurrency("data.osu.players"), 1);
    }

    #[test]
    fn parses_routes_and_transport() {
        let config = EisenbahnConfig::from_toml(
            r#"
            [transport]
            kind = "zmq"
            socket = "tcp"
            base_port = 6000

            [routes."data.osu.players"]
            concurrency = 4

            [routes."data.osu.matches"]
            endpoint = "tcp://10.0.0.7:5700"
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.kind, TransportKind::Zmq);
        assert_eq!(config.concurrency("data.osu.players"), 4);
        assert_eq!(config.concurrency("data.osu.beatmaps"), 1);

        let table = RouteTable::standard();
        assert_eq!(
            config.endpoint_for("data.osu.matches", &table).unwrap(),
            Transport::tcp("10.0.0.7", 5700)
        );
        let auto = config.endpoint_for("data.osu.players", &table).unwrap();
        assert!(matches!(auto, Transport::Tcp { port, .. } if port >= 6000));
    }

    #[test]
    fn ipc_endpoints_are_named_after_keys() {
        let config = EisenbahnConfig::local();
        let endpoints = config.endpoints(&RouteTable::standard()).unwrap();
        assert_eq!(endpoints.len(), 10);
        assert_eq!(
            endpoints["data.osutrack.players"],
            Transport::ipc("data-osutrack-players")
        );
    }

    #[test]
    fn rejects_unknown_routing_key() {
        let err = EisenbahnConfig::from_toml(
            r#"
            [routes."data.osu.scores"]
            concurrency = 2
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("data.osu.scores"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = EisenbahnConfig::from_toml(
            r#"
            [routes."data.osu.beatmaps"]
            concurrency = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("concurrency 0"));
    }

    #[test]
    fn rejects_unknown_transport_kind() {
        assert!(EisenbahnConfig::from_toml("[transport]\nkind = \"amqp\"\n").is_err());
    }

    #[test]
    fn rejects_shared_endpoint() {
        let err = EisenbahnConfig::from_toml(
            r#"
            [transport]
            kind = "zmq"

            [routes."data.osu.players"]
            endpoint = "tcp://127.0.0.1:7000"

            [routes."data.osu.matches"]
            endpoint = "tcp://127.0.0.1:7000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("share endpoint"));
    }

    #[test]
    fn transport_kind_from_str() {
        assert_eq!("ZMQ".parse::<TransportKind>().unwrap(), TransportKind::Zmq);
        assert!("kafka".parse::<TransportKind>().is_err());
    }
}
