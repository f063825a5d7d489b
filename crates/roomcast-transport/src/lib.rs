//! # roomcast-transport
//!
//! Transport abstraction layer for the roomcast relay.
//!
//! The relay core consumes already-established duplex connections. This
//! crate defines that seam and provides the WebSocket implementations:
//!
//! - **WebSocketTransport** - Standalone listener using tokio-tungstenite
//! - **AxumConnection** - Wraps a socket upgraded by an axum route
//!
//! ## Transport Abstraction
//!
//! Every connection splits into a write half and a read half so the relay
//! can read and write from separate tasks.
//!
//! ```rust,ignore
//! use roomcast_transport::{Connection, WireMessage};
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut sink, mut source) = conn.split();
//!     while let Ok(Some(WireMessage::Data(frame))) = source.recv().await {
//!         let _ = sink.send(WireMessage::Data(frame)).await;
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "axum")]
pub mod axum_ws;

pub use traits::{
    Connection, ConnectionId, FrameSink, FrameSource, Transport, TransportError, WireMessage,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[cfg(feature = "axum")]
pub use axum_ws::AxumConnection;

/// Envelopes are JSON, so data frames go out as text unless the payload is
/// not UTF-8.
#[cfg(any(feature = "websocket", feature = "axum"))]
pub(crate) fn payload_text(data: bytes::Bytes) -> Result<String, Vec<u8>> {
    String::from_utf8(data.to_vec()).map_err(|e| e.into_bytes())
}

/// Classify a failed WebSocket read. A frame over the negotiated size limit
/// is a protocol violation by the peer; anything else is a transport fault.
#[cfg(any(feature = "websocket", feature = "axum"))]
pub(crate) fn read_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};

    match e {
        WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
            TransportError::Protocol(roomcast_protocol::ProtocolError::FrameTooLarge {
                size,
                max: max_size,
            })
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        e => TransportError::ReceiveFailed(e.to_string()),
    }
}
