//! Codec for encoding and decoding roomcast envelopes.
//!
//! Envelopes are plain JSON objects, one per transport frame. The codec
//! enforces the frame size limit before handing the body to serde.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum inbound frame size in bytes.
pub const MAX_FRAME_SIZE: usize = 512;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body is not a valid envelope.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Envelope could not be serialized.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Encode an envelope to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Decode an envelope, enforcing [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is oversized or is not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode an envelope, enforcing a caller-supplied size limit.
///
/// # Errors
///
/// Returns an error if the frame is oversized or is not a valid envelope.
pub fn decode_with_limit(data: &[u8], max: usize) -> Result<Envelope, ProtocolError> {
    check_size(data.len(), max)?;
    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

/// Check a frame length against a size limit.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `size` exceeds `max`.
pub fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}
