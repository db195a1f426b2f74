//! In-process network linking nodes of one process.
//!
//! Each connection is a pair of [`ConnectionId`]s, one per side. Nodes can
//! be isolated to model a peer that silently stops answering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Acceptor, ConnectionId, NetworkEvent, Transport};
use crate::config::{NodeId, PeerConfig};
use crate::message::Message;

struct Endpoint {
    events: mpsc::UnboundedSender<NetworkEvent>,
    acceptor: Option<Acceptor>,
}

struct Link {
    owner: NodeId,
    remote: ConnectionId,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<NodeId, Endpoint>,
    links: HashMap<ConnectionId, Link>,
    isolated: HashSet<NodeId>,
}

impl Hub {
    fn deliver(&self, node_id: &str, event: NetworkEvent) {
        if let Some(endpoint) = self.endpoints.get(node_id) {
            // A stopped node has dropped its receiver.
            let _ = endpoint.events.send(event);
        }
    }

    fn unlink(&mut self, conn: ConnectionId) -> Option<(Link, Link)> {
        let local = self.links.remove(&conn)?;
        let remote = self.links.remove(&local.remote)?;
        Some((local, remote))
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id` and return its transport and event stream.
    pub fn endpoint(
        &self,
        node_id: impl Into<NodeId>,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<NetworkEvent>) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.lock().endpoints.insert(
            node_id.clone(),
            Endpoint {
                events: tx,
                acceptor: None,
            },
        );
        let transport = Arc::new(MemoryTransport {
            node_id,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Start accepting connections for `node_id`.
    pub fn attach_acceptor(&self, node_id: &str, acceptor: Acceptor) {
        if let Some(endpoint) = self.hub.lock().endpoints.get_mut(node_id) {
            endpoint.acceptor = Some(acceptor);
        }
    }

    /// Drop all traffic to and from `node_id` without closing anything.
    pub fn isolate(&self, node_id: &str) {
        self.hub.lock().isolated.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.hub.lock().isolated.remove(node_id);
    }

    /// Take `node_id` off the network, closing all of its connections.
    pub fn remove(&self, node_id: &str) {
        let mut hub = self.hub.lock();
        hub.endpoints.remove(node_id);
        let owned: Vec<ConnectionId> = hub
            .links
            .iter()
            .filter(|(_, link)| link.owner == node_id)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in owned {
            if let Some((local, remote)) = hub.unlink(conn) {
                hub.deliver(&remote.owner, NetworkEvent::Closed { conn: local.remote });
            }
        }
    }

    /// Open connections owned by `node_id`.
    pub fn connection_count(&self, node_id: &str) -> usize {
        self.hub
            .lock()
            .links
            .values()
            .filter(|link| link.owner == node_id)
            .count()
    }

    fn connect(&self, from: &str, peer: &PeerConfig) {
        let mut hub = self.hub.lock();
        let reachable = !hub.isolated.contains(from) && !hub.isolated.contains(&peer.node_id);
        let acceptor = hub
            .endpoints
            .get(&peer.node_id)
            .and_then(|endpoint| endpoint.acceptor.clone());

        let local = ConnectionId::new();
        let remote = ConnectionId::new();
        let accepted = match acceptor {
            Some(acceptor) if reachable => acceptor.try_hand_off(remote),
            _ => false,
        };
        if !accepted {
            hub.deliver(
                from,
                NetworkEvent::ConnectFailed {
                    node_id: peer.node_id.clone(),
                },
            );
            return;
        }

        hub.links.insert(
            local,
            Link {
                owner: from.to_string(),
                remote,
            },
        );
        hub.links.insert(
            remote,
            Link {
                owner: peer.node_id.clone(),
                remote: local,
            },
        );
        hub.deliver(
            from,
            NetworkEvent::Connected {
                conn: local,
                node_id: peer.node_id.clone(),
            },
        );
    }

    fn send(&self, from: &str, conn: ConnectionId, message: Message) {
        let hub = self.hub.lock();
        let Some(link) = hub.links.get(&conn) else {
            tracing::trace!(conn = %conn, "Send on closed connection dropped");
            return;
        };
        if link.owner != from {
            return;
        }
        let Some(remote) = hub.links.get(&link.remote) else {
            return;
        };
        if hub.isolated.contains(from) || hub.isolated.contains(&remote.owner) {
            return;
        }
        hub.deliver(
            &remote.owner,
            NetworkEvent::Received {
                conn: link.remote,
                message,
            },
        );
    }

    fn close(&self, from: &str, conn: ConnectionId) {
        let mut hub = self.hub.lock();
        if hub.links.get(&conn).map(|link| link.owner.as_str()) != Some(from) {
            return;
        }
        if let Some((local, remote)) = hub.unlink(conn) {
            hub.deliver(&remote.owner, NetworkEvent::Closed { conn: local.remote });
        }
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Transport for MemoryTransport {
    fn send(&self, conn: ConnectionId, message: Message) {
        self.network.send(&self.node_id, conn, message);
    }

    fn connect(&self, peer: &PeerConfig) {
        self.network.connect(&self.node_id, peer);
    }

    fn close(&self, conn: ConnectionId) {
        self.network.close(&self.node_id, conn);
    }
}
