//! Adapter for WebSockets upgraded by axum.
//!
//! The HTTP server owns the upgrade handshake; this module wraps the
//! resulting socket so the relay can treat it like any other [`Connection`].

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::codec;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::debug;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError, WireMessage};

/// A connection over an axum-upgraded WebSocket.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<String>,
    max_frame_size: usize,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_frame_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            max_frame_size,
        }
    }

    /// Record the peer address reported by the HTTP layer.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let this = *self;
        let (sink, stream) = this.socket.split();
        (
            Box::new(AxumSink { inner: sink }),
            Box::new(AxumSource {
                inner: stream,
                max_frame_size: this.max_frame_size,
            }),
        )
    }
}

struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Data(data) => match crate::payload_text(data) {
                Ok(text) => Message::Text(text),
                Err(binary) => Message::Binary(binary),
            },
            WireMessage::Ping(data) => Message::Ping(data.to_vec()),
            WireMessage::Pong(data) => Message::Pong(data.to_vec()),
        };

        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

struct AxumSource {
    inner: SplitStream<WebSocket>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.inner.next().await {
            Some(Ok(Message::Text(text))) => {
                codec::check_size(text.len(), self.max_frame_size)?;
                Ok(Some(WireMessage::Data(Bytes::from(text))))
            }
            Some(Ok(Message::Binary(data))) => {
                codec::check_size(data.len(), self.max_frame_size)?;
                Ok(Some(WireMessage::Data(Bytes::from(data))))
            }
            Some(Ok(Message::Ping(data))) => Ok(Some(WireMessage::Ping(Bytes::from(data)))),
            Some(Ok(Message::Pong(data))) => Ok(Some(WireMessage::Pong(Bytes::from(data)))),
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame");
                Ok(None)
            }
            // axum boxes the underlying tungstenite error
            Some(Err(e)) => match e.into_inner().downcast::<WsError>() {
                Ok(ws) => Err(crate::read_error(*ws)),
                Err(other) => Err(TransportError::ReceiveFailed(other.to_string())),
            },
            None => Ok(None),
        }
    }
}
