//! # Connection Registry
//!
//! Maps a session id to the live connection serving it. Processing cycles
//! look the connection up when they have output; a missing entry means the
//! client went away and the output is dropped.
//!
//! Entries are owned by the connection that registered them: `unregister`
//! only removes an entry when the connection id matches, so a reconnect that
//! replaced the entry is never torn down by the stale connection's cleanup.

use crate::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// Outbound channel of one connection.
pub type ConnectionSender = UnboundedSender<ServerMessage>;

pub trait ConnectionRegistry: Send + Sync {
    /// Register a connection for a session, replacing any previous owner.
    fn register(&self, session_id: &str, connection_id: &str, sender: ConnectionSender);

    /// Sender of the connection currently serving a session.
    fn lookup(&self, session_id: &str) -> Option<ConnectionSender>;

    /// Release the entry if `connection_id` still owns it. Returns whether it did.
    fn unregister(&self, session_id: &str, connection_id: &str) -> bool;

    fn connection_count(&self) -> usize;

    /// Deliver a message to a session's connection. Returns false if there is
    /// no live connection.
    fn send(&self, session_id: &str, message: ServerMessage) -> bool {
        match self.lookup(session_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug)]
struct Registration {
    connection_id: String,
    sender: ConnectionSender,
}

/// `ConnectionRegistry` over a lock-protected map.
#[derive(Debug, Default)]
pub struct InMemoryConnectionRegistry {
    connections: RwLock<HashMap<String, Registration>>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionRegistry for InMemoryConnectionRegistry {
    fn register(&self, session_id: &str, connection_id: &str, sender: ConnectionSender) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let previous = connections.insert(
            session_id.to_string(),
            Registration {
                connection_id: connection_id.to_string(),
                sender,
            },
        );

        if let Some(previous) = previous {
            tracing::info!(
                session_id = %session_id,
                replaced = %previous.connection_id,
                connection_id = %connection_id,
                "Connection replaced for session"
            );
        }
    }

    fn lookup(&self, session_id: &str) -> Option<ConnectionSender> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .get(session_id)
            .filter(|registration| !registration.sender.is_closed())
            .map(|registration| registration.sender.clone())
    }

    fn unregister(&self, session_id: &str, connection_id: &str) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let owned = connections
            .get(session_id)
            .is_some_and(|registration| registration.connection_id == connection_id);

        if owned {
            connections.remove(session_id);
        }
        owned
    }

    fn connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_register_lookup_send() {
        let registry = InMemoryConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("s1", "c1", tx);

        assert!(registry.lookup("s1").is_some());
        assert!(registry.send("s1", ServerMessage::Pong { timestamp: 1 }));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong { timestamp: 1 });
        assert!(!registry.send("missing", ServerMessage::Pong { timestamp: 1 }));
    }

    #[test]
    fn test_unregister_only_by_owner_and_only_once() {
        let registry = InMemoryConnectionRegistry::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();

        registry.register("s1", "old", old_tx);
        registry.register("s1", "new", new_tx);

        assert!(!registry.unregister("s1", "old"));
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.unregister("s1", "new"));
        assert!(!registry.unregister("s1", "new"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_closed_receiver_is_not_returned() {
        let registry = InMemoryConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("s1", "c1", tx);
        drop(rx);

        assert!(registry.lookup("s1").is_none());
        assert!(!registry.send("s1", ServerMessage::Pong { timestamp: 1 }));
    }
}
