//! Local session registry
//!
//! The node-local half of fan-out: which sockets are connected here, and
//! which of them have joined which room bucket. Cross-node routing happens on
//! the bus; envelopes arriving from it land in [`SessionRegistry::deliver`],
//! which walks the room bucket and pushes the event onto each connection's
//! outgoing queue.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::protocol::{BusEnvelope, ConnectionId, ServerEvent};

/// Handle to one connected socket
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_id: Uuid,
    pub username: String,
    /// Outgoing event queue, drained by the connection's writer task
    pub tx: mpsc::UnboundedSender<ServerEvent>,
}

/// All sockets attached to this node
#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// room id -> sockets that joined the room on this node
    rooms: DashMap<Uuid, HashSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, connection_id: ConnectionId, handle: ConnectionHandle) {
        self.connections.insert(connection_id, handle);
    }

    /// Drop a connection and purge it from every room bucket
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        for mut entry in self.rooms.iter_mut() {
            entry.value_mut().remove(&connection_id);
        }
        self.rooms.retain(|_, members| !members.is_empty());
        self.connections
            .remove(&connection_id)
            .map(|(_, handle)| handle)
    }

    pub fn join_room(&self, connection_id: ConnectionId, room_id: Uuid) {
        self.rooms
            .entry(room_id)
            .or_default()
            .insert(connection_id);
    }

    pub fn leave_room(&self, connection_id: ConnectionId, room_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(&room_id) {
            members.remove(&connection_id);
        }
    }

    /// Send one event to one socket. False when the socket is gone.
    pub fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(&connection_id) {
            Some(handle) => handle.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a bus envelope to every local socket in the room bucket,
    /// honoring the origin-connection exclusion.
    pub fn deliver(&self, envelope: &BusEnvelope) {
        let Some(members) = self.rooms.get(&envelope.room_id) else {
            return;
        };
        for connection_id in members.iter() {
            if Some(*connection_id) == envelope.exclude {
                continue;
            }
            if let Some(handle) = self.connections.get(connection_id) {
                if handle.tx.send(envelope.event.clone()).is_err() {
                    trace!(connection_id = %connection_id, "dropping event for closed socket");
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Distinct users with at least one socket on this node
    pub fn local_users(&self) -> Vec<(Uuid, String)> {
        let mut seen = HashSet::new();
        self.connections
            .iter()
            .filter_map(|entry| {
                let handle = entry.value();
                seen.insert(handle.user_id)
                    .then(|| (handle.user_id, handle.username.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;

    fn connect(registry: &SessionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add_connection(
            connection_id,
            ConnectionHandle {
                user_id: Uuid::new_v4(),
                username: "alice".to_string(),
                tx,
            },
        );
        (connection_id, rx)
    }

    fn envelope(room_id: Uuid, exclude: Option<ConnectionId>) -> BusEnvelope {
        BusEnvelope {
            room_id,
            exclude,
            event: ServerEvent::HeartbeatAck,
        }
    }

    #[test]
    fn test_deliver_reaches_room_members_only() {
        let registry = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (in_room, mut in_rx) = connect(&registry);
        let (_outside, mut out_rx) = connect(&registry);

        registry.join_room(in_room, room);
        registry.deliver(&envelope(room, None));

        assert!(in_rx.try_recv().is_ok());
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn test_deliver_honors_exclusion() {
        let registry = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (sender, mut sender_rx) = connect(&registry);
        let (other, mut other_rx) = connect(&registry);

        registry.join_room(sender, room);
        registry.join_room(other, room);
        registry.deliver(&envelope(room, Some(sender)));

        assert!(sender_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[test]
    fn test_remove_connection_purges_buckets() {
        let registry = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (conn, mut rx) = connect(&registry);

        registry.join_room(conn, room);
        assert!(registry.remove_connection(conn).is_some());
        registry.deliver(&envelope(room, None));

        assert!(rx.try_recv().is_err());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_leave_room_stops_delivery() {
        let registry = SessionRegistry::new();
        let room = Uuid::new_v4();
        let (conn, mut rx) = connect(&registry);

        registry.join_room(conn, room);
        registry.leave_room(conn, room);
        registry.deliver(&envelope(room, None));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_local_users_dedupes_sockets() {
        let registry = SessionRegistry::new();
        let user_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        for tx in [tx, tx2] {
            registry.add_connection(
                Uuid::new_v4(),
                ConnectionHandle {
                    user_id,
                    username: "alice".to_string(),
                    tx,
                },
            );
        }
        assert_eq!(registry.local_users().len(), 1);
    }
}
