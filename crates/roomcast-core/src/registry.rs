//! Room registry for roomcast.
//!
//! The registry is the single source of truth for room membership. Every
//! endpoint mutates it and the bus bridge reads it for fan-out.
//!
//! Locking discipline: a room's shard lock is always taken before the
//! membership shard lock, never the other way round.

use crate::handle::ConnectionHandle;
use crate::room::Room;
use dashmap::DashMap;
use roomcast_protocol::RoomId;
use roomcast_transport::ConnectionId;
use std::collections::HashSet;
use tracing::{debug, info};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Whether to delete rooms when their last member leaves.
    pub auto_delete_empty_rooms: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auto_delete_empty_rooms: true,
        }
    }
}

/// Process-wide mapping from room ID to members.
pub struct RoomRegistry {
    /// Rooms indexed by ID.
    rooms: DashMap<RoomId, Room>,
    /// Reverse links (connection_id -> rooms it has joined).
    memberships: DashMap<ConnectionId, HashSet<RoomId>>,
    /// Configuration.
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.memberships.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Joining a room twice is a no-op. Returns `true` if the connection was
    /// newly added.
    pub fn add_member(&self, room_id: RoomId, handle: &ConnectionHandle) -> bool {
        let mut room = self.rooms.entry(room_id).or_insert_with(|| {
            debug!(room = room_id, "Creating new room");
            Room::new(room_id)
        });

        let added = room.insert(handle.clone());
        if added {
            self.memberships
                .entry(handle.id().clone())
                .or_default()
                .insert(room_id);
        }

        added
    }

    /// Remove a connection from a room.
    ///
    /// Missing rooms and non-members are a no-op. Returns `true` if the
    /// connection was a member.
    pub fn remove_member(&self, room_id: RoomId, connection_id: &ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(&room_id) {
            Some(mut room) => {
                let removed = room.remove(connection_id);
                if removed {
                    if let Some(mut joined) = self.memberships.get_mut(connection_id) {
                        joined.remove(&room_id);
                    }
                    self.memberships
                        .remove_if(connection_id, |_, joined| joined.is_empty());
                }
                removed
            }
            None => false,
        };

        if removed {
            self.prune(room_id);
        }

        removed
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Returns the rooms it was removed from.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let Some((_, joined)) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };

        let mut left = Vec::with_capacity(joined.len());
        for room_id in joined {
            if let Some(mut room) = self.rooms.get_mut(&room_id) {
                if room.remove(connection_id) {
                    left.push(room_id);
                }
            }
            self.prune(room_id);
        }

        debug!(connection = %connection_id, rooms = left.len(), "Removed from all rooms");
        left
    }

    /// Snapshot of a room's members.
    ///
    /// Returns an empty list for unknown rooms.
    #[must_use]
    pub fn members_of(&self, room_id: RoomId) -> Vec<ConnectionHandle> {
        self.rooms
            .get(&room_id)
            .map(|room| room.members())
            .unwrap_or_default()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: RoomId) -> bool {
        self.rooms.contains_key(&room_id)
    }

    /// Get the member count for a room.
    #[must_use]
    pub fn member_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .get(&room_id)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    /// Check if a connection is a member of a room.
    #[must_use]
    pub fn is_member(&self, room_id: RoomId, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(&room_id)
            .map(|room| room.is_member(connection_id))
            .unwrap_or(false)
    }

    /// Get the number of rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn prune(&self, room_id: RoomId) {
        if !self.config.auto_delete_empty_rooms {
            return;
        }
        if self
            .rooms
            .remove_if(&room_id, |_, room| room.is_empty())
            .is_some()
        {
            debug!(room = room_id, "Deleted empty room");
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of rooms.
    pub room_count: usize,
    /// Number of connections in at least one room.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
}
