//! # roomcast-protocol
//!
//! Wire envelope definitions for the roomcast room relay.
//!
//! Clients exchange JSON envelopes with the relay, one per frame:
//!
//! - `join` / `exit` - Room membership
//! - `message` - Publish to every member of a room
//!
//! Unrecognized envelope types decode successfully and are ignored by the
//! relay.
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::message(1, 5, "hi");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{Envelope, EnvelopeType, RoomId, UserId};
