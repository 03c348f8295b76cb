//! Connection registry: which users are reachable right now, and over which
//! connection.
//!
//! Every open connection is tracked, but only the most recent one per user is
//! *routed* (last-connected-wins). A superseded connection stays open and keeps
//! receiving broadcasts to all clients, but is no longer a fan-out target for
//! its user.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use parley_shared::protocol::ServerEvent;
use parley_shared::{ConnectionId, UserId};

use crate::error::DeliveryWarning;

/// Sender half feeding a connection's writer task.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// A live transport connection bound to one user for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    connected_at: DateTime<Utc>,
    tx: EventSender,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, tx: EventSender) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id,
            connected_at: Utc::now(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue an event for this connection. Never blocks.
    pub fn emit(&self, event: ServerEvent) -> Result<(), DeliveryWarning> {
        self.tx
            .send(event)
            .map_err(|_| DeliveryWarning::ConnectionClosed {
                user: self.user_id,
                connection: self.id,
            })
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// Every open connection, routed or not.
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    /// The routed connection per user.
    routes: Arc<DashMap<UserId, ConnectionId>>,
    /// Serializes presence snapshots so clients never see an older snapshot
    /// after a newer one.
    presence: Arc<Mutex<()>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` to its user, replacing any earlier routed connection,
    /// and publish the new presence snapshot to everyone.
    pub fn register(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let user = handle.user_id();

        self.connections.insert(id, handle);
        let previous = self.routes.insert(user, id);

        match previous {
            Some(prev) if prev != id => info!(
                user = %user,
                connection = %id,
                superseded = %prev,
                "User reconnected, previous connection no longer routed"
            ),
            _ => info!(user = %user, connection = %id, "User connected"),
        }

        self.broadcast_presence();
    }

    /// Forget a connection. The user's route is only removed if it still
    /// points at this connection; a newer connection for the same user is
    /// left untouched. Returns the removed handle.
    pub fn unregister(&self, connection: &ConnectionId) -> Option<ConnectionHandle> {
        let (_, handle) = self.connections.remove(connection)?;
        let user = handle.user_id();

        let was_routed = self
            .routes
            .remove_if(&user, |_, current| current == connection)
            .is_some();

        info!(
            user = %user,
            connection = %connection,
            was_routed,
            "Connection unregistered"
        );

        self.broadcast_presence();
        Some(handle)
    }

    /// The routed connection of `user`, if online.
    pub fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        let id = self.routes.get(user).map(|entry| *entry.value())?;
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Any open connection by id, routed or not.
    pub fn connection(&self, connection: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections
            .get(connection)
            .map(|entry| entry.value().clone())
    }

    /// Online users, sorted for stable snapshots.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.routes.iter().map(|entry| *entry.key()).collect();
        users.sort();
        users
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send the full online-user set to every open connection.
    fn broadcast_presence(&self) {
        let _guard = self.presence.lock().unwrap_or_else(|e| e.into_inner());

        let event = ServerEvent::GetOnlineUsers(self.online_users());
        let mut closed = 0usize;
        for entry in self.connections.iter() {
            if entry.value().emit(event.clone()).is_err() {
                closed += 1;
            }
        }

        if closed > 0 {
            debug!(closed, "Skipped presence update for closing connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(user: UserId) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(user, tx), rx)
    }

    fn last_presence(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Option<Vec<UserId>> {
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::GetOnlineUsers(users) = event {
                last = Some(users);
            }
        }
        last
    }

    #[test]
    fn test_register_then_unregister_clears_presence() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (conn, _rx) = connect(user);
        let id = conn.id();

        registry.register(conn);
        assert_eq!(registry.lookup(&user).map(|c| c.id()), Some(id));

        registry.unregister(&id);
        assert!(registry.lookup(&user).is_none());
        assert!(!registry.online_users().contains(&user));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_last_connection_wins() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (conn_a, _rx_a) = connect(user);
        let (conn_b, _rx_b) = connect(user);
        let (id_a, id_b) = (conn_a.id(), conn_b.id());

        registry.register(conn_a);
        registry.register(conn_b);
        assert_eq!(registry.lookup(&user).map(|c| c.id()), Some(id_b));

        // Dropping the superseded connection leaves the route alone.
        assert!(registry.unregister(&id_a).is_some());
        assert_eq!(registry.lookup(&user).map(|c| c.id()), Some(id_b));
        assert_eq!(registry.online_users(), vec![user]);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(&ConnectionId::new()).is_none());
    }

    #[test]
    fn test_presence_broadcast_to_all_connections() {
        let registry = ConnectionRegistry::new();
        let (alice, bob) = (UserId::new(), UserId::new());
        let (conn_a, mut rx_a) = connect(alice);
        let (conn_b, mut rx_b) = connect(bob);
        let id_b = conn_b.id();

        registry.register(conn_a);
        assert_eq!(last_presence(&mut rx_a), Some(vec![alice]));

        registry.register(conn_b);
        let mut both = vec![alice, bob];
        both.sort();
        assert_eq!(last_presence(&mut rx_a), Some(both.clone()));
        assert_eq!(last_presence(&mut rx_b), Some(both));

        registry.unregister(&id_b);
        assert_eq!(last_presence(&mut rx_a), Some(vec![alice]));
    }

    #[test]
    fn test_emit_on_closed_connection_warns() {
        let user = UserId::new();
        let (conn, rx) = connect(user);
        drop(rx);

        let err = conn.emit(ServerEvent::GetOnlineUsers(vec![])).unwrap_err();
        assert!(matches!(err, DeliveryWarning::ConnectionClosed { .. }));
    }

    #[test]
    fn test_concurrent_users_do_not_interfere() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut users = Vec::new();

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..16 {
                let user = UserId::new();
                let (conn, rx) = connect(user);
                users.push(user);
                receivers.push(rx);
                let registry = registry.clone();
                handles.push(scope.spawn(move || registry.register(conn)));
            }
            for handle in handles {
                handle.join().unwrap();
            }
        });

        users.sort();
        assert_eq!(registry.online_users(), users);
    }
}
