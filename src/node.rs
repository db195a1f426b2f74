use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, NodeId};
use crate::error::{CoordError, Result};
use crate::event::PeerEvent;
use crate::network::{Acceptor, ConnectionId, MemoryNetwork, NetworkEvent, Transport};
use crate::raft::RaftRole;
use crate::shard::Shard;

const PEER_EVENT_CAPACITY: usize = 256;

/// Snapshot of a node's consensus state, published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub connected_peers: Vec<NodeId>,
    /// When the node entered its current role.
    pub since: DateTime<Utc>,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

/// A configured node, not yet running.
pub struct Node {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    handoff: mpsc::Receiver<ConnectionId>,
}

impl Node {
    /// Wire a node to an arbitrary transport. The network layer feeds
    /// `events`, and hands accepted connections to the sender paired with
    /// `handoff`.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        handoff: mpsc::Receiver<ConnectionId>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            handoff,
        }
    }

    /// Register the node on an in-process network.
    pub fn in_memory(config: NodeConfig, network: &MemoryNetwork) -> Self {
        let (transport, events) = network.endpoint(config.node_id.clone());
        let (acceptor, handoff) = Acceptor::channel(config.handoff_capacity);
        network.attach_acceptor(&config.node_id, acceptor);
        Self::new(config, transport, events, handoff)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Validate the configuration and spawn the node's shard.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid (including timeouts
    /// the timer wheel cannot hold) or the timer thread cannot be started.
    pub fn start(self, cancel: CancellationToken) -> Result<NodeHandle> {
        self.config.validate()?;

        let (peer_events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        let (shard, status) = Shard::new(
            &self.config,
            self.transport,
            self.events,
            self.handoff,
            peer_events.clone(),
        )?;

        tracing::info!(
            node_id = %self.config.node_id,
            peers = self.config.peers.len(),
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            "Starting node"
        );

        let task = tokio::spawn(shard.run(cancel.clone()));
        Ok(NodeHandle {
            node_id: self.config.node_id,
            status,
            peer_events,
            cancel,
            task,
        })
    }
}

/// Control and observation handle for a running node.
pub struct NodeHandle {
    node_id: NodeId,
    status: watch::Receiver<NodeStatus>,
    peer_events: broadcast::Sender<PeerEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Peer connect and disconnect notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_events.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until the status satisfies `predicate`. Returns the matching
    /// status, or `None` on timeout or if the node stopped.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<NodeStatus>
    where
        F: FnMut(&NodeStatus) -> bool,
    {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if predicate(&current) {
                        return Some(current.clone());
                    }
                }
                if status.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Cancel the node and wait for its shard to exit.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the shard to exit on its own, e.g. after a fatal error.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CoordError::Internal(format!("shard task failed: {}", e))),
        }
    }
}
