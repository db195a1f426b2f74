//! Seam between the consensus core and the byte-level network layer.
//!
//! The core never touches sockets. It sends decoded [`Message`]s on a
//! [`ConnectionId`] through a [`Transport`], and observes the network through
//! a stream of [`NetworkEvent`]s plus the [`Acceptor`] hand-off queue for
//! freshly accepted, still anonymous connections.

pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{NodeId, PeerConfig};
use crate::message::Message;

pub use memory::{MemoryNetwork, MemoryTransport};

/// Opaque handle for one transport-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound operations the core needs from the network layer.
///
/// All calls are fire-and-forget. A failed send shows up later as a
/// heartbeat timeout, a failed connect as [`NetworkEvent::ConnectFailed`].
pub trait Transport: Send + Sync {
    fn send(&self, conn: ConnectionId, message: Message);

    /// Start connecting to `peer`. Completion is reported as
    /// [`NetworkEvent::Connected`].
    fn connect(&self, peer: &PeerConfig);

    fn close(&self, conn: ConnectionId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// An outbound connection to `node_id` is established but not yet
    /// confirmed by the peer.
    Connected { conn: ConnectionId, node_id: NodeId },
    ConnectFailed { node_id: NodeId },
    Received { conn: ConnectionId, message: Message },
    /// The remote side closed the connection or it broke.
    Closed { conn: ConnectionId },
}

/// Sending half of the bounded queue that hands accepted connections to the
/// node's processing loop.
#[derive(Debug, Clone)]
pub struct Acceptor {
    tx: mpsc::Sender<ConnectionId>,
}

impl Acceptor {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ConnectionId>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Never blocks. Returns `false` if the queue is full or the node is
    /// gone, in which case the accept loop should refuse the connection.
    pub fn try_hand_off(&self, conn: ConnectionId) -> bool {
        match self.tx.try_send(conn) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %conn, "Hand-off queue full, refusing connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
