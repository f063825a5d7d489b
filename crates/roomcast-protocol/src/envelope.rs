//! Envelope types for the roomcast protocol.
//!
//! An envelope is the unit of application traffic exchanged with clients.
//! Envelopes travel as JSON text frames; liveness control frames are carried
//! out of band by the transport and never appear here.

use serde::{Deserialize, Deserializer, Serialize};

/// A room identifier.
pub type RoomId = u32;

/// A sender identity. Not validated against any authentication scheme.
pub type UserId = u32;

/// What an envelope asks the relay to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// Add the sending connection to a room.
    Join,
    /// Remove the sending connection from a room.
    Exit,
    /// Publish the envelope to every member of a room.
    Message,
    /// Any type the relay does not recognize. Ignored on dispatch.
    #[default]
    #[serde(other)]
    Unknown,
}

impl EnvelopeType {
    /// Wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Join => "join",
            EnvelopeType::Exit => "exit",
            EnvelopeType::Message => "message",
            EnvelopeType::Unknown => "unknown",
        }
    }
}

/// A decoded wire envelope.
///
/// Missing and `null` fields decode to their zero value, matching the
/// lenient decoding clients have always relied on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    /// Sender identity.
    #[serde(deserialize_with = "null_as_default")]
    pub user_id: UserId,
    /// Target room.
    #[serde(deserialize_with = "null_as_default")]
    pub room_id: RoomId,
    /// Arbitrary text payload.
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
    /// Envelope type.
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub kind: EnvelopeType,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(
        kind: EnvelopeType,
        user_id: UserId,
        room_id: RoomId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            room_id,
            content: content.into(),
            kind,
        }
    }

    /// Create a `join` envelope.
    #[must_use]
    pub fn join(user_id: UserId, room_id: RoomId) -> Self {
        Self::new(EnvelopeType::Join, user_id, room_id, "")
    }

    /// Create an `exit` envelope.
    #[must_use]
    pub fn exit(user_id: UserId, room_id: RoomId) -> Self {
        Self::new(EnvelopeType::Exit, user_id, room_id, "")
    }

    /// Create a `message` envelope.
    #[must_use]
    pub fn message(user_id: UserId, room_id: RoomId, content: impl Into<String>) -> Self {
        Self::new(EnvelopeType::Message, user_id, room_id, content)
    }
}
