//! Connection registry.
//!
//! One live connection per authenticated user. Registering a user that is
//! already connected replaces the old entry (last writer wins) and hands the
//! superseded connection back to the caller.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::{ConnectionId, ServerEvent, UserId};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate unique connection ID
#[inline]
pub fn generate_connection_id() -> ConnectionId {
    CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// A live client connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub connected_at: Instant,
    tx: OutboundTx,
}

impl Connection {
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Connection registry
pub struct ConnectionRegistry {
    by_user: DashMap<UserId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            by_user: DashMap::new(),
        }
    }

    /// Register a connection, returning its id and the one it replaced.
    pub fn register(
        &self,
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        tx: OutboundTx,
    ) -> (ConnectionId, Option<Connection>) {
        let user_id = user_id.into();
        let connection = Connection {
            id: generate_connection_id(),
            user_id: user_id.clone(),
            username: username.into(),
            connected_at: Instant::now(),
            tx,
        };
        let id = connection.id;
        let replaced = self.by_user.insert(user_id, connection);
        (id, replaced)
    }

    /// Remove the user's entry only if `id` is still the current connection.
    pub fn unregister(&self, user_id: &str, id: ConnectionId) -> bool {
        self.by_user
            .remove_if(user_id, |_, conn| conn.id == id)
            .is_some()
    }

    pub fn current(&self, user_id: &str) -> Option<ConnectionId> {
        self.by_user.get(user_id).map(|c| c.id)
    }

    pub fn is_current(&self, user_id: &str, id: ConnectionId) -> bool {
        self.current(user_id) == Some(id)
    }

    pub fn username(&self, user_id: &str) -> Option<String> {
        self.by_user.get(user_id).map(|c| c.username.clone())
    }

    /// Deliver to the user's current connection.
    pub fn send(&self, user_id: &str, event: ServerEvent) -> bool {
        self.by_user
            .get(user_id)
            .map(|c| c.send(event))
            .unwrap_or(false)
    }

    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.by_user
            .iter()
            .filter(|entry| entry.value().send(event.clone()))
            .count()
    }

    pub fn count(&self) -> usize {
        self.by_user.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QueueStatus;

    fn status() -> ServerEvent {
        ServerEvent::QueueStatus(QueueStatus {
            users_in_queue: 1,
            position: None,
        })
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let (first, replaced) = registry.register("alice", "Alice", tx1);
        assert!(replaced.is_none());

        let (second, replaced) = registry.register("alice", "Alice", tx2);
        let old = replaced.unwrap();
        assert_eq!(old.id, first);
        assert_ne!(first, second);
        assert_eq!(registry.count(), 1);

        assert!(registry.send("alice", status()));
        assert!(matches!(rx2.recv().await, Some(Outbound::Event(_))));

        old.close();
        assert_eq!(rx1.recv().await, Some(Outbound::Close));
    }

    #[test]
    fn test_stale_unregister_keeps_successor() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let (old, _) = registry.register("alice", "Alice", tx1);
        let (new, _) = registry.register("alice", "Alice", tx2);

        assert!(!registry.unregister("alice", old));
        assert!(registry.is_current("alice", new));
        assert!(registry.unregister("alice", new));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_broadcast_skips_closed_receivers() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        registry.register("alice", "Alice", tx1);
        registry.register("bob", "Bob", tx2);
        drop(rx2);

        assert_eq!(registry.broadcast(&status()), 1);
        assert!(!registry.send("carol", status()));
        assert_eq!(registry.username("bob").as_deref(), Some("Bob"));
    }
}
