use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use parley_shared::protocol::ServerEvent;
use parley_shared::{ConnectionId, RoomId, UserId};

use crate::registry::ConnectionRegistry;

/// Connections currently joined to one group room.
#[derive(Debug, Default)]
pub struct Room {
    connections: HashSet<ConnectionId>,
}

impl Room {
    pub fn connections(&self) -> &HashSet<ConnectionId> {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Connection-scoped room membership. Rooms exist only while someone is in
/// them; nothing here is persisted.
#[derive(Clone)]
pub struct RoomManager {
    rooms: Arc<DashMap<RoomId, Room>>,
    /// Reverse index so a disconnect can leave everything in one pass.
    joined: Arc<DashMap<ConnectionId, HashSet<RoomId>>>,
    registry: ConnectionRegistry,
}

impl RoomManager {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            rooms: Default::default(),
            joined: Default::default(),
            registry,
        }
    }

    /// Join a room, creating it if missing. Returns `false` if the connection
    /// was already joined.
    pub fn join(&self, connection: ConnectionId, room_id: RoomId) -> bool {
        let inserted = {
            let mut room = self.rooms.entry(room_id).or_default();
            let inserted = room.connections.insert(connection);
            if inserted {
                info!(
                    room = %room_id,
                    connection = %connection,
                    connections = room.len(),
                    "Connection joined room"
                );
            }
            inserted
        };

        self.joined.entry(connection).or_default().insert(room_id);
        inserted
    }

    /// Leave a room. Absent rooms and non-members are not an error.
    pub fn leave(&self, connection: &ConnectionId, room_id: &RoomId) -> bool {
        let removed = self.remove_from_room(connection, room_id);

        if let Some(mut rooms) = self.joined.get_mut(connection) {
            rooms.remove(room_id);
        }
        self.joined.remove_if(connection, |_, rooms| rooms.is_empty());

        removed
    }

    /// Drop a connection from every room it joined. Called on disconnect.
    pub fn leave_all(&self, connection: &ConnectionId) -> usize {
        let Some((_, rooms)) = self.joined.remove(connection) else {
            return 0;
        };

        let mut left = 0;
        for room_id in &rooms {
            if self.remove_from_room(connection, room_id) {
                left += 1;
            }
        }

        debug!(connection = %connection, rooms = left, "Connection left all rooms");
        left
    }

    /// Remove every connection of `user` from the room. Returns how many
    /// connections were evicted.
    pub fn evict_user(&self, room_id: &RoomId, user: &UserId) -> usize {
        let mut evicted = 0;
        for connection in self.members(room_id) {
            let belongs_to_user = self
                .registry
                .connection(&connection)
                .is_some_and(|handle| handle.user_id() == *user);

            if belongs_to_user && self.leave(&connection, room_id) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(room = %room_id, user = %user, evicted, "Evicted user from room");
        }
        evicted
    }

    /// Emit `event` to every joined connection except `except`. Returns the
    /// users that received it.
    pub fn broadcast(
        &self,
        room_id: &RoomId,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> HashSet<UserId> {
        let mut delivered = HashSet::new();

        for connection in self.members(room_id) {
            if except == Some(&connection) {
                continue;
            }

            let Some(handle) = self.registry.connection(&connection) else {
                continue;
            };

            match handle.emit(event.clone()) {
                Ok(()) => {
                    delivered.insert(handle.user_id());
                }
                Err(warning) => debug!(
                    room = %room_id,
                    warning = %warning,
                    "Dropping room event for closed connection"
                ),
            }
        }

        delivered
    }

    /// Snapshot of the connections joined to a room.
    pub fn members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|room| room.connections().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_joined(&self, connection: &ConnectionId, room_id: &RoomId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.connections().contains(connection))
    }

    #[cfg(test)]
    pub fn list_rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }

    fn remove_from_room(&self, connection: &ConnectionId, room_id: &RoomId) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                let removed = room.connections.remove(connection);
                if removed {
                    info!(
                        room = %room_id,
                        connection = %connection,
                        connections = room.len(),
                        "Connection left room"
                    );
                }
                removed
            }
            None => false,
        };

        if self
            .rooms
            .remove_if(room_id, |_, room| room.is_empty())
            .is_some()
        {
            info!(room = %room_id, "Removed empty room");
        }

        removed
    }
}
