//! Room abstraction for roomcast.
//!
//! A room is a numbered group of connections. Rooms hold handles only; they
//! never own the connections themselves.

use crate::handle::ConnectionHandle;
use roomcast_protocol::RoomId;
use roomcast_transport::ConnectionId;
use std::collections::HashMap;
use tracing::debug;

/// A room and its current members.
#[derive(Debug)]
pub struct Room {
    /// Room identifier.
    id: RoomId,
    /// Members keyed by connection ID.
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
        }
    }

    /// Get the room ID.
    #[must_use]
    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a member.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn insert(&mut self, handle: ConnectionHandle) -> bool {
        let connection_id = handle.id().clone();
        if self.members.contains_key(&connection_id) {
            return false;
        }
        self.members.insert(connection_id.clone(), handle);
        debug!(room = self.id, connection = %connection_id, "Connection joined room");
        true
    }

    /// Remove a member.
    ///
    /// Returns `true` if the connection was a member.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(room = self.id, connection = %connection_id, "Connection left room");
        }
        removed
    }

    /// Snapshot of the current members.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionHandle> {
        self.members.values().cloned().collect()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
