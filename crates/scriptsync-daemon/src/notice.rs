//! User-facing notices.
//!
//! The service reports lifecycle events (started, following another owner,
//! listener connected) through a [`NoticeSink`]. A host embedding the
//! service can surface them however it likes; [`LogNotices`] just logs them.

use std::net::SocketAddr;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ServiceStarted { port: u16 },
    ServiceStopped { port: u16 },
    /// Another process owns the endpoint; we relay through the spool.
    Following { port: u16 },
    ListenerConnected { remote: SocketAddr, port: u16 },
    ListenerDisconnected { remote: SocketAddr },
    StartFailed { reason: String },
    DeliveryFailed { reason: String },
}

impl Notice {
    pub fn severity(&self) -> Severity {
        match self {
            Self::StartFailed { .. } | Self::DeliveryFailed { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceStarted { port } => write!(f, "broadcast service started on port {port}"),
            Self::ServiceStopped { port } => write!(f, "broadcast service on port {port} stopped"),
            Self::Following { port } => {
                write!(f, "port {port} is owned by another process, relaying changes to it")
            }
            Self::ListenerConnected { remote, port } => {
                write!(f, "{remote} connected (port: {port})")
            }
            Self::ListenerDisconnected { remote } => write!(f, "{remote} disconnected"),
            Self::StartFailed { reason } => write!(f, "failed to start broadcast service: {reason}"),
            Self::DeliveryFailed { reason } => write!(f, "failed to deliver change: {reason}"),
        }
    }
}

/// Receives notices. Implementations must not block.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Logs every notice through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotices;

impl NoticeSink for LogNotices {
    fn notify(&self, notice: Notice) {
        match notice.severity() {
            Severity::Info => info!(notice = %notice, "scriptsync"),
            Severity::Warning => warn!(notice = %notice, "scriptsync"),
        }
    }
}
