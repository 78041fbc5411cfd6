//! Daemon errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("port {port} is owned by another process")]
    AddrInUse { port: u16 },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] scriptsync_protocol::ProtocolError),

    #[error("registry error: {0}")]
    Registry(#[from] scriptsync_registry::RegistryError),

    #[error("relay error: {0}")]
    Relay(#[from] scriptsync_relay::RelayError),

    #[error("watch error: {0}")]
    Watch(#[from] scriptsync_watch::WatchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
