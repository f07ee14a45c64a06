//! Process-wide registry of live connections.
//!
//! Connections register under their synthetic peer name the moment they
//! start and are removed when shutdown begins, so lookups miss them while
//! they drain. The per-endpoint counter is only decremented once the drain
//! has finished, which is what `wait_num_connections(endpoint, 0)`
//! observes. The registry also carries a small topic-subscription surface
//! so out-of-band payloads can be fanned out to interested peers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::counters::{CounterError, Counters};

/// The registry's view of a connection. The concrete type is
/// [`crate::connection::Connection`]; tests may register anything that
/// speaks this interface.
#[async_trait]
pub trait ManagedConnection: Send + Sync + std::fmt::Debug {
    /// Full name of the owning endpoint.
    fn parent_name(&self) -> String;

    /// Registry key: `"{peer_prefix}_{own}_{peer}"`.
    fn peer_name(&self) -> String;

    /// Feed inbound bytes to the connection (datagram demultiplexing).
    fn data_received(&self, data: Bytes);

    /// Tear the connection down because its transport is gone.
    fn transport_lost(&self, error: Option<String>);

    /// Deliver an out-of-band payload to the connection's notification
    /// queue.
    fn deliver_notification(&self, payload: serde_json::Value);

    /// Resolve once every message this connection has decoded has been
    /// processed.
    async fn wait_messages_processed(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Two live connections computed the same peer name; peer names must be
    /// unique per process.
    #[error("a connection for peer {peer:?} is already registered")]
    DuplicatePeer { peer: String },
    #[error(transparent)]
    Counter(#[from] CounterError),
}

#[derive(Debug, Default)]
pub struct ConnectionsManager {
    connections: Mutex<FxHashMap<String, Arc<dyn ManagedConnection>>>,
    counters: Counters,
    subscriptions: Mutex<FxHashMap<String, HashSet<String>>>,
}

/// The process-wide manager instance.
#[must_use]
pub fn connections() -> &'static ConnectionsManager {
    static MANAGER: Lazy<ConnectionsManager> = Lazy::new(ConnectionsManager::default);
    &MANAGER
}

impl ConnectionsManager {
    /// Register a connection and increment its endpoint counter.
    /// Returns the endpoint's live count after the add.
    pub fn add(&self, connection: Arc<dyn ManagedConnection>) -> Result<u64, ManagerError> {
        let peer = connection.peer_name();
        let parent = connection.parent_name();
        {
            let mut connections = self.connections.lock().expect("registry lock poisoned");
            if connections.contains_key(&peer) {
                return Err(ManagerError::DuplicatePeer { peer });
            }
            connections.insert(peer, connection);
        }
        Ok(self.counters.increment(&parent)?)
    }

    /// Remove a connection from the registry without touching its counter.
    /// This is the first half of shutdown; [`ConnectionsManager::decrement`]
    /// is the second.
    pub fn remove(&self, connection: &dyn ManagedConnection) {
        let peer = connection.peer_name();
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .remove(&peer);
        let mut subscriptions = self
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        for peers in subscriptions.values_mut() {
            peers.remove(&peer);
        }
    }

    /// Decrement the endpoint counter once the connection has fully
    /// drained. Returns the count after the decrement.
    pub fn decrement(&self, connection: &dyn ManagedConnection) -> Result<u64, CounterError> {
        self.counters.decrement(&connection.parent_name())
    }

    #[must_use]
    pub fn get(&self, peer: &str) -> Option<Arc<dyn ManagedConnection>> {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .get(peer)
            .cloned()
    }

    /// Snapshot of every live connection.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn ManagedConnection>> {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of the live connections owned by one endpoint.
    #[must_use]
    pub fn children(&self, parent_name: &str) -> Vec<Arc<dyn ManagedConnection>> {
        self.all()
            .into_iter()
            .filter(|c| c.parent_name() == parent_name)
            .collect()
    }

    #[must_use]
    pub fn num_connections(&self, parent_name: &str) -> u64 {
        self.counters.get_num(parent_name)
    }

    #[must_use]
    pub fn num_has_connected(&self, parent_name: &str) -> u64 {
        self.counters.total_increments(parent_name)
    }

    pub async fn wait_num_connections(&self, parent_name: &str, num: u64) {
        self.counters.wait_for(parent_name, num).await;
    }

    pub async fn wait_num_has_connected(&self, parent_name: &str, num: u64) {
        self.counters
            .wait_for_total_increments(parent_name, num)
            .await;
    }

    /// Resolve once every message decoded by the endpoint's live
    /// connections has been processed.
    pub async fn wait_all_messages_processed(&self, parent_name: &str) {
        let children = self.children(parent_name);
        futures::future::join_all(
            children
                .iter()
                .map(|connection| connection.wait_messages_processed()),
        )
        .await;
    }

    /// Forget an endpoint's counter. Called when the endpoint closes, after
    /// its last connection has drained.
    pub fn clear_server(&self, parent_name: &str) {
        self.counters.remove(parent_name);
    }

    /// Reset all state. For process start and tests.
    pub fn clear(&self) {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .clear();
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clear();
        self.counters.clear();
    }

    pub fn subscribe(&self, peer: &str, topic: &str) {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .entry(topic.to_owned())
            .or_default()
            .insert(peer.to_owned());
    }

    pub fn unsubscribe(&self, peer: &str, topic: &str) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        if let Some(peers) = subscriptions.get_mut(topic) {
            peers.remove(peer);
            if peers.is_empty() {
                subscriptions.remove(topic);
            }
        }
    }

    #[must_use]
    pub fn peer_is_subscribed(&self, peer: &str, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .get(topic)
            .is_some_and(|peers| peers.contains(peer))
    }

    #[must_use]
    pub fn is_subscribed(&self, connection: &dyn ManagedConnection, topic: &str) -> bool {
        self.peer_is_subscribed(&connection.peer_name(), topic)
    }

    /// Fan a payload out to every connection subscribed to `topic`.
    pub fn notify(&self, topic: &str, payload: serde_json::Value) {
        let peers: Vec<String> = {
            let subscriptions = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            match subscriptions.get(topic) {
                Some(peers) => peers.iter().cloned().collect(),
                None => return,
            }
        };
        for peer in peers {
            if let Some(connection) = self.get(&peer) {
                connection.deliver_notification(payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Debug)]
    struct FakeConnection {
        parent: String,
        peer: String,
        notifications: mpsc::UnboundedSender<serde_json::Value>,
    }

    #[async_trait]
    impl ManagedConnection for FakeConnection {
        fn parent_name(&self) -> String {
            self.parent.clone()
        }

        fn peer_name(&self) -> String {
            self.peer.clone()
        }

        fn data_received(&self, _data: Bytes) {}

        fn transport_lost(&self, _error: Option<String>) {}

        fn deliver_notification(&self, payload: serde_json::Value) {
            let _ = self.notifications.send(payload);
        }

        async fn wait_messages_processed(&self) {}
    }

    fn fake(
        parent: &str,
        peer: &str,
    ) -> (
        Arc<FakeConnection>,
        mpsc::UnboundedReceiver<serde_json::Value>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(FakeConnection {
                parent: parent.to_owned(),
                peer: peer.to_owned(),
                notifications: tx,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn add_remove_and_count_waiters() {
        let manager = ConnectionsManager::default();
        let parent = "TCP Server 127.0.0.1:9001";
        let (conn, _rx) = fake(parent, "tcp_127.0.0.1:9001_127.0.0.1:50000");

        let waiter = tokio::spawn({
            let conn = conn.clone();
            async move { conn.wait_messages_processed().await }
        });
        waiter.await.unwrap();

        assert_eq!(manager.add(conn.clone()).unwrap(), 1);
        assert_eq!(manager.num_connections(parent), 1);
        assert!(manager.get(&conn.peer_name()).is_some());

        manager.remove(conn.as_ref());
        assert!(manager.get(&conn.peer_name()).is_none());
        // Registry removal does not touch the counter.
        assert_eq!(manager.num_connections(parent), 1);
        assert_eq!(manager.decrement(conn.as_ref()).unwrap(), 0);
        manager.wait_num_connections(parent, 0).await;
        manager.wait_num_has_connected(parent, 1).await;
    }

    #[tokio::test]
    async fn duplicate_peer_is_rejected() {
        let manager = ConnectionsManager::default();
        let (first, _rx1) = fake("E", "tcp_a_b");
        let (second, _rx2) = fake("E", "tcp_a_b");
        manager.add(first).unwrap();
        let err = manager.add(second).unwrap_err();
        assert!(matches!(err, ManagerError::DuplicatePeer { .. }));
        // The failed add did not bump the counter.
        assert_eq!(manager.num_connections("E"), 1);
    }

    #[tokio::test]
    async fn waiter_resolves_exactly_at_target() {
        let manager = Arc::new(ConnectionsManager::default());
        let parent = "E-exact";
        let waiter = tokio::spawn({
            let manager = manager.clone();
            let parent = parent.to_owned();
            async move { manager.wait_num_connections(&parent, 3).await }
        });
        for i in 0..3 {
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());
            let (conn, _rx) = fake(parent, &format!("tcp_own_peer{i}"));
            manager.add(conn).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_notify_unsubscribe() {
        let manager = ConnectionsManager::default();
        let (conn, mut rx) = fake("E-sub", "tcp_own_peer");
        manager.add(conn.clone()).unwrap();

        manager.notify("test", serde_json::json!("message sent"));
        assert!(rx.try_recv().is_err());

        manager.subscribe(&conn.peer_name(), "test");
        assert!(manager.is_subscribed(conn.as_ref(), "test"));
        assert!(manager.peer_is_subscribed(&conn.peer_name(), "test"));
        manager.notify("test", serde_json::json!("message sent"));
        assert_eq!(rx.try_recv().unwrap(), serde_json::json!("message sent"));

        manager.unsubscribe(&conn.peer_name(), "test");
        assert!(!manager.is_subscribed(conn.as_ref(), "test"));
        manager.notify("test", serde_json::json!("message sent"));
        assert!(rx.try_recv().is_err());
    }
}
