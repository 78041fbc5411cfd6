//! WebSocket transport: bind and accept on loopback.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::connection::PendingConnection;
use crate::error::ProtocolError;

/// The listening side of the broadcast endpoint.
pub struct WsTransport {
    listener: TcpListener,
}

impl WsTransport {
    /// Bind a new listening socket.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProtocolError::Bind { addr, source })?;
        info!(addr = %addr, "websocket transport bound");
        Ok(Self { listener })
    }

    /// Wrap a socket that was already bound elsewhere (e.g. during election).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_std(listener: std::net::TcpListener) -> Result<Self, ProtocolError> {
        listener
            .set_nonblocking(true)
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let listener =
            TcpListener::from_std(listener).map_err(|e| ProtocolError::Connection(e.to_string()))?;
        Ok(Self { listener })
    }

    /// Accept an incoming TCP connection.
    ///
    /// The WebSocket upgrade is left to the caller so that a slow client does
    /// not hold up the accept loop.
    pub async fn accept(&self) -> Result<PendingConnection, ProtocolError> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        debug!(remote = %remote, "accepted connection");
        Ok(PendingConnection::new(stream, remote))
    }

    /// Get the local address this transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.listener
            .local_addr()
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }
}
