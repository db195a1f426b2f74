use std::collections::{HashMap, HashSet};

use crate::config::NodeId;
use crate::network::ConnectionId;

/// Result of binding a connection to a node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identified {
    /// The node had no live connection before.
    New,
    /// The node was already bound to this same connection.
    Unchanged,
    /// The node was bound to another connection, which the caller must close.
    Replaced(ConnectionId),
}

/// Which node ids have a live, identity-confirmed connection, and which
/// connections are still anonymous.
///
/// Owned by a single shard; never shared.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    connected: HashMap<NodeId, ConnectionId>,
    by_connection: HashMap<ConnectionId, NodeId>,
    anonymous: HashSet<ConnectionId>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_anonymous(&mut self, conn: ConnectionId) {
        if !self.by_connection.contains_key(&conn) {
            self.anonymous.insert(conn);
        }
    }

    pub fn is_anonymous(&self, conn: &ConnectionId) -> bool {
        self.anonymous.contains(conn)
    }

    /// Forget an anonymous connection. Returns `false` if it was not (or no
    /// longer) anonymous.
    pub fn remove_anonymous(&mut self, conn: &ConnectionId) -> bool {
        self.anonymous.remove(conn)
    }

    /// Bind `conn` to `node_id`. Last write wins: a previous connection for
    /// the same node is unbound and reported for closing.
    pub fn upsert(&mut self, node_id: &str, conn: ConnectionId) -> Identified {
        self.anonymous.remove(&conn);
        match self.connected.insert(node_id.to_string(), conn) {
            None => {
                self.by_connection.insert(conn, node_id.to_string());
                Identified::New
            }
            Some(previous) if previous == conn => Identified::Unchanged,
            Some(previous) => {
                self.by_connection.remove(&previous);
                self.by_connection.insert(conn, node_id.to_string());
                Identified::Replaced(previous)
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<ConnectionId> {
        self.connected.get(node_id).copied()
    }

    pub fn node_for(&self, conn: &ConnectionId) -> Option<&NodeId> {
        self.by_connection.get(conn)
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connected.contains_key(node_id)
    }

    /// Remove `node_id` only if it is still bound to `conn`. A timeout armed
    /// for a connection that has since been superseded must not evict the
    /// newer one.
    pub fn remove_if_current(&mut self, node_id: &str, conn: ConnectionId) -> bool {
        if self.connected.get(node_id) != Some(&conn) {
            return false;
        }
        self.connected.remove(node_id);
        self.by_connection.remove(&conn);
        true
    }

    /// Drop whatever `conn` was registered as. Returns the node id if the
    /// connection was an identified one.
    pub fn remove_connection(&mut self, conn: &ConnectionId) -> Option<NodeId> {
        self.anonymous.remove(conn);
        let node_id = self.by_connection.remove(conn)?;
        self.connected.remove(&node_id);
        Some(node_id)
    }

    /// Number of identified peers.
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn anonymous_count(&self) -> usize {
        self.anonymous.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = (&NodeId, ConnectionId)> {
        self.connected.iter().map(|(node_id, conn)| (node_id, *conn))
    }

    /// Identified peer ids, sorted.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.connected.keys().cloned().collect();
        nodes.sort();
        nodes
    }
}
