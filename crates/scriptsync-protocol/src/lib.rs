//! WebSocket transport layer and wire protocol for scriptsync.
//!
//! This crate handles the loopback listening socket, the WebSocket upgrade
//! handshake (via tokio-tungstenite), JSON text framing of [`Message`]s and
//! protocol-level ping frames.
//!
//! [`Message`]: scriptsync_types::Message

pub mod connection;
pub mod error;
pub mod transport;
pub mod wire;

pub use connection::{FrameReceiver, FrameSender, Incoming, ListenerConnection, PendingConnection};
pub use error::ProtocolError;
pub use transport::WsTransport;
