//! Transport abstraction traits for roomcast.
//!
//! The relay never touches a socket directly. A [`Transport`] hands out
//! established [`Connection`]s, and each connection splits into an
//! independent [`FrameSink`] and [`FrameSource`] so that reading and writing
//! can proceed from different tasks.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of one accepted connection.
///
/// Cheap to clone; rooms and the membership index hold copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    /// Generate an ID from the current time and a process-wide counter.
    #[must_use]
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("conn_{:x}_{}", nanos, seq))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound frame violated the envelope limits.
    #[error("Protocol error: {0}")]
    Protocol(#[from] roomcast_protocol::ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake and close failures.
    #[error("{0}")]
    Other(String),
}

/// A frame as seen by the relay.
///
/// `Ping` and `Pong` are the out-of-band liveness control frames; they never
/// carry envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// An application frame (a JSON envelope on the wire).
    Data(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness acknowledgment.
    Pong(Bytes),
}

/// Source of new client connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next client and complete its handshake.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Short name for logs (e.g., "websocket").
    fn name(&self) -> &'static str;

    /// Whether the transport can still accept clients.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An established duplex connection to a single client.
pub trait Connection: Send {
    fn id(&self) -> &ConnectionId;

    /// Peer address, when the transport knows it.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned write and read halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

/// The read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError>;
}

/// The write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Start the closing handshake. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}
