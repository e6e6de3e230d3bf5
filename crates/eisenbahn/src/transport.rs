use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EisenbahnError;

/// Directory holding IPC socket files.
pub const IPC_DIR: &str = "/tmp/otr";

/// Where a queue's PUSH/PULL pair meets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket `{IPC_DIR}/{name}.sock`, same host only.
    Ipc(String),
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// ZeroMQ endpoint string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(_) => format!("ipc://{}", self.socket_path().unwrap_or_default().display()),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    fn socket_path(&self) -> Option<PathBuf> {
        match self {
            Self::Ipc(name) => Some(PathBuf::from(IPC_DIR).join(format!("{name}.sock"))),
            Self::Tcp { .. } => None,
        }
    }

    /// Make an IPC endpoint bindable: create its directory and unlink a
    /// socket file left behind by a previous process. TCP needs nothing.
    pub fn prepare_bind(&self) -> Result<(), EisenbahnError> {
        let Some(path) = self.socket_path() else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| EisenbahnError::Transport(format!("{}: {e}", path.display()));
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale IPC socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }
        Ok(())
    }

    /// Parse `ipc:///tmp/otr/foo.sock` or `tcp://host:port`.
    pub fn parse(endpoint: &str) -> Result<Self, EisenbahnError> {
        let invalid = |what: &str| EisenbahnError::Config(format!("{what} in endpoint '{endpoint}'"));
        match endpoint.split_once("://") {
            Some(("ipc", path)) => {
                let path = PathBuf::from(path);
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| invalid("missing socket name"))?;
                Ok(Self::ipc(name))
            }
            Some(("tcp", addr)) => {
                let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
                let port = port.parse().map_err(|_| invalid("bad port"))?;
                Ok(Self::tcp(host, port))
            }
            _ => Err(invalid("unsupported scheme (expected ipc:// or tcp://)")),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.endpoint())
    }
}
