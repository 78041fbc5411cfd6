//! WebSocket connection and frame handling.

use std::net::SocketAddr;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use scriptsync_types::Message;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::wire::{decode_message, encode_message};

type WsStream = WebSocketStream<TcpStream>;

/// An accepted TCP connection that has not completed the WebSocket upgrade.
pub struct PendingConnection {
    stream: TcpStream,
    remote: SocketAddr,
}

impl PendingConnection {
    pub(crate) fn new(stream: TcpStream, remote: SocketAddr) -> Self {
        Self { stream, remote }
    }

    /// Remote address of the peer.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Perform the server side of the upgrade handshake.
    pub async fn upgrade(self) -> Result<ListenerConnection, ProtocolError> {
        let ws = tokio_tungstenite::accept_async(self.stream)
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        debug!(remote = %self.remote, "websocket upgrade complete");
        Ok(ListenerConnection {
            stream: ws,
            remote: self.remote,
        })
    }
}

/// An established WebSocket connection to (or from) a listener.
pub struct ListenerConnection {
    stream: WsStream,
    remote: SocketAddr,
}

impl ListenerConnection {
    /// Connect to a broadcast endpoint as a listener.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let (ws, _response) = tokio_tungstenite::client_async(format!("ws://{addr}/"), tcp)
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        debug!(remote = %addr, "connected to broadcast endpoint");
        Ok(Self {
            stream: ws,
            remote: addr,
        })
    }

    /// Get the remote address of this connection.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        let (sink, stream) = self.stream.split();
        (FrameSender { sink }, FrameReceiver { stream })
    }
}

/// Writes text, ping and close frames.
pub struct FrameSender {
    sink: SplitSink<WsStream, WsMessage>,
}

impl FrameSender {
    /// Encode and send a message as one text frame.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        let text = encode_message(msg)?;
        self.send_text(text).await
    }

    /// Send an already encoded message.
    pub async fn send_text(&mut self, text: String) -> Result<(), ProtocolError> {
        let len = text.len();
        self.sink.send(WsMessage::Text(text)).await?;
        trace!(len, "sent text frame");
        Ok(())
    }

    /// Send a protocol-level ping with an empty payload.
    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        self.sink.send(WsMessage::Ping(Vec::new())).await?;
        trace!("sent ping");
        Ok(())
    }

    /// Send a close frame and shut the sink down.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        match self.sink.send(WsMessage::Close(None)).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {}
            Err(e) => return Err(e.into()),
        }
        match self.sink.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A frame read from the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Ping,
    Pong,
}

/// Reads frames from the connection.
pub struct FrameReceiver {
    stream: SplitStream<WsStream>,
}

impl FrameReceiver {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has closed the connection. Pong replies to
    /// incoming pings are queued by the WebSocket layer itself.
    pub async fn recv(&mut self) -> Result<Option<Incoming>, ProtocolError> {
        loop {
            let Some(frame) = self.stream.next().await else {
                return Ok(None);
            };
            match frame {
                Ok(WsMessage::Text(text)) => return Ok(Some(Incoming::Text(text))),
                Ok(WsMessage::Ping(_)) => return Ok(Some(Incoming::Ping)),
                Ok(WsMessage::Pong(_)) => return Ok(Some(Incoming::Pong)),
                Ok(WsMessage::Close(_)) => return Ok(None),
                Ok(WsMessage::Binary(data)) => {
                    debug!(len = data.len(), "ignoring binary frame");
                }
                Ok(WsMessage::Frame(_)) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive the next decoded message, skipping control frames.
    pub async fn recv_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.recv().await? {
                Some(Incoming::Text(text)) => return decode_message(&text).map(Some),
                Some(Incoming::Ping | Incoming::Pong) => {}
                None => return Ok(None),
            }
        }
    }
}
