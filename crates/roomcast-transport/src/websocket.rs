//! Standalone WebSocket listener.
//!
//! Owns its TCP socket and performs the upgrade itself with
//! tokio-tungstenite, so it works without an HTTP router in front of it.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{codec, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig as FrameLimits, Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::traits::{
    Connection, ConnectionId, FrameSink, FrameSource, Transport, TransportError, WireMessage,
};

type Socket = WebSocketStream<TcpStream>;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub bind_addr: SocketAddr,
    /// Inbound frames above this many bytes are rejected.
    pub max_frame_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Accepts WebSocket clients on a bound TCP listener.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Bind the listener described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "WebSocket listener bound");

        Ok(Self { listener, config })
    }

    /// Bind `addr` with the default frame limit.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let config = WebSocketConfig {
            bind_addr: addr,
            ..WebSocketConfig::default()
        };
        Self::new(config).await
    }

    /// Address actually bound, useful after binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// tungstenite settings that reject oversized frames from the header,
    /// before the payload is buffered.
    fn frame_limits(&self) -> FrameLimits {
        let mut limits = FrameLimits::default();
        limits.max_message_size = Some(self.config.max_frame_size);
        limits.max_frame_size = Some(self.config.max_frame_size);
        limits
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (tcp, peer) = self.listener.accept().await?;

        let socket = accept_async_with_config(tcp, Some(self.frame_limits()))
            .await
            .map_err(|e| {
                warn!(peer = %peer, error = %e, "WebSocket upgrade failed");
                TransportError::Other(format!("upgrade from {} failed: {}", peer, e))
            })?;

        let connection = WebSocketConnection {
            id: ConnectionId::generate(),
            socket,
            peer,
            max_frame_size: self.config.max_frame_size,
        };
        debug!(connection = %connection.id, peer = %peer, "WebSocket accepted");
        Ok(Box::new(connection))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn is_healthy(&self) -> bool {
        self.listener.local_addr().is_ok()
    }
}

/// A client accepted by [`WebSocketTransport`].
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: Socket,
    peer: SocketAddr,
    max_frame_size: usize,
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.peer.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let this = *self;
        let (sink, stream) = this.socket.split();
        (
            Box::new(WebSocketSink { inner: sink }),
            Box::new(WebSocketSource {
                inner: stream,
                max_frame_size: this.max_frame_size,
            }),
        )
    }
}

struct WebSocketSink {
    inner: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Data(data) => match crate::payload_text(data) {
                Ok(text) => Message::Text(text),
                Err(binary) => Message::Binary(binary),
            },
            WireMessage::Ping(data) => Message::Ping(data.to_vec()),
            WireMessage::Pong(data) => Message::Pong(data.to_vec()),
        };

        self.inner.send(message).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
            e => TransportError::SendFailed(e.to_string()),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }
}

struct WebSocketSource {
    inner: SplitStream<Socket>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => {
                    codec::check_size(text.len(), self.max_frame_size)?;
                    return Ok(Some(WireMessage::Data(Bytes::from(text))));
                }
                Some(Ok(Message::Binary(data))) => {
                    codec::check_size(data.len(), self.max_frame_size)?;
                    return Ok(Some(WireMessage::Data(Bytes::from(data))));
                }
                Some(Ok(Message::Ping(data))) => {
                    // tungstenite queues the pong reply itself
                    return Ok(Some(WireMessage::Ping(Bytes::from(data))));
                }
                Some(Ok(Message::Pong(data))) => {
                    return Ok(Some(WireMessage::Pong(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Peer sent close");
                    return Ok(None);
                }
                // Only produced when writing raw frames
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(crate::read_error(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_protocol::ProtocolError;

    #[test]
    fn test_default_limit() {
        let config = WebSocketConfig::default();
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.name(), "websocket");
        assert!(transport.is_healthy());
    }

    async fn connected_pair() -> (
        Box<dyn Connection>,
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let transport = WebSocketTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let (client, server) = tokio::join!(
            tokio_tungstenite::connect_async(format!("ws://{}", addr)),
            transport.accept()
        );
        (server.unwrap(), client.unwrap().0)
    }

    #[tokio::test]
    async fn test_data_ping_and_close() {
        let (server, mut client) = connected_pair().await;
        assert!(server.remote_addr().is_some());
        let (mut sink, mut source) = server.split();

        client
            .send(Message::Text(r#"{"type":"join"}"#.to_string()))
            .await
            .unwrap();
        match source.recv().await.unwrap() {
            Some(WireMessage::Data(data)) => assert_eq!(&data[..], br#"{"type":"join"}"#),
            other => panic!("unexpected: {:?}", other),
        }

        sink.send(WireMessage::Data(Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("hello".to_string())
        );

        client.close(None).await.unwrap();
        assert!(source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (server, mut client) = connected_pair().await;
        let (_sink, mut source) = server.split();

        client
            .send(Message::Text("x".repeat(MAX_FRAME_SIZE + 1)))
            .await
            .unwrap();
        assert!(matches!(
            source.recv().await,
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge { max: MAX_FRAME_SIZE, .. }))
        ));
    }

    #[tokio::test]
    async fn test_huge_frame_rejected_from_header() {
        const HUGE: usize = 8 << 20;

        let (server, mut client) = connected_pair().await;
        let (_sink, mut source) = server.split();

        // The server stops reading at the header, so the send may never finish
        let writer = tokio::spawn(async move {
            let _ = client.send(Message::Binary(vec![b'x'; HUGE])).await;
            client
        });

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), source.recv())
            .await
            .unwrap();
        match result {
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge { size, max })) => {
                assert_eq!(size, HUGE);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
        writer.abort();
    }
}
