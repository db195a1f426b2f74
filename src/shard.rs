//! The single-threaded processing loop that owns one node's consensus state.
//!
//! Everything that mutates the registry or the state machine runs here:
//! network events, fired timers and accepted connections are all funnelled
//! into one `select!` loop, so no handler ever needs a lock.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cluster::{LivenessProtocol, NodeRegistry};
use crate::config::NodeConfig;
use crate::error::{CoordError, Result};
use crate::event::{Io, PeerEvent, TimerEvent};
use crate::message::{Message, Request, Response};
use crate::network::{ConnectionId, NetworkEvent, Transport};
use crate::node::NodeStatus;
use crate::raft::RaftNode;
use crate::timer::{TimerReceiver, TimerScheduler};

/// State mutated by the loop. Kept apart from the transport and timers so
/// that handlers can borrow both at once.
struct Core {
    raft: RaftNode,
    liveness: LivenessProtocol,
    registry: NodeRegistry,
    peer_events: broadcast::Sender<PeerEvent>,
}

impl Core {
    fn start(&mut self, io: &Io<'_>) -> Result<()> {
        self.raft.start(io)?;
        self.liveness.start(io);
        Ok(())
    }

    fn on_accepted(&mut self, io: &Io<'_>, conn: ConnectionId) -> Result<()> {
        tracing::debug!(node_id = %self.raft.id(), conn = %conn, "Accepted connection");
        self.liveness.on_accepted(io, &mut self.registry, conn)
    }

    fn on_network(&mut self, io: &Io<'_>, event: NetworkEvent) -> Result<()> {
        match event {
            NetworkEvent::Connected { conn, node_id } => {
                self.liveness.on_outbound_connected(io, conn, &node_id)
            }
            NetworkEvent::ConnectFailed { node_id } => self.liveness.on_connect_failed(io, &node_id),
            NetworkEvent::Received { conn, message } => self.on_message(io, conn, message),
            NetworkEvent::Closed { conn } => {
                let event = self.liveness.on_connection_closed(io, &mut self.registry, conn)?;
                self.on_peer_event(io, event)
            }
        }
    }

    fn on_message(&mut self, io: &Io<'_>, conn: ConnectionId, message: Message) -> Result<()> {
        tracing::trace!(
            node_id = %self.raft.id(),
            conn = %conn,
            api = message.api_name(),
            "Received message"
        );
        match message {
            Message::Request(Request::Heartbeat { node_id }) => {
                let event = self
                    .liveness
                    .on_heartbeat_request(io, &mut self.registry, conn, &node_id)?;
                self.on_peer_event(io, event)
            }
            Message::Response(Response::Heartbeat) => {
                let event = self
                    .liveness
                    .on_heartbeat_response(io, &mut self.registry, conn)?;
                self.on_peer_event(io, event)
            }
            Message::Request(request) => {
                let Some(from) = self.registry.node_for(&conn).cloned() else {
                    tracing::warn!(
                        node_id = %self.raft.id(),
                        conn = %conn,
                        api = request.api_id(),
                        "Request on unidentified connection dropped"
                    );
                    return Ok(());
                };
                if let Some(response) = self.raft.handle_request(io, &self.registry, &from, &request)? {
                    io.send(conn, response);
                }
                Ok(())
            }
            Message::Response(response) => {
                let Some(from) = self.registry.node_for(&conn).cloned() else {
                    tracing::warn!(
                        node_id = %self.raft.id(),
                        conn = %conn,
                        api = response.api_id(),
                        "Response on unidentified connection dropped"
                    );
                    return Ok(());
                };
                self.raft.handle_response(io, &self.registry, &from, &response)
            }
        }
    }

    fn on_timer(&mut self, io: &Io<'_>, event: TimerEvent) -> Result<()> {
        match event {
            TimerEvent::ElectionTimeout | TimerEvent::LeaderHeartbeat => {
                self.raft.handle_timer(io, &self.registry, &event)
            }
            TimerEvent::PeerKeepAlive { node_id } => self.liveness.on_keepalive(io, &node_id),
            TimerEvent::PeerTimeout { node_id, conn } => {
                let event = self
                    .liveness
                    .on_peer_timeout(io, &mut self.registry, &node_id, conn)?;
                self.on_peer_event(io, event)
            }
            TimerEvent::ConnectionTimeout { conn } => {
                self.liveness
                    .on_connection_timeout(io, &mut self.registry, conn)
            }
            TimerEvent::Reconnect { node_id } => {
                self.liveness.on_reconnect(io, &self.registry, &node_id);
                Ok(())
            }
        }
    }

    fn on_peer_event(&mut self, io: &Io<'_>, event: Option<PeerEvent>) -> Result<()> {
        let Some(event) = event else {
            return Ok(());
        };
        match &event {
            PeerEvent::Connected(node_id) => self.raft.on_peer_connected(io, &self.registry, node_id),
            PeerEvent::Disconnected(_) => self.raft.on_peer_disconnected(io, &self.registry)?,
        }
        // No subscribers is fine.
        let _ = self.peer_events.send(event);
        Ok(())
    }

    fn status(&self) -> NodeStatus {
        let properties = self.raft.properties();
        NodeStatus {
            node_id: self.raft.id().to_string(),
            role: self.raft.role(),
            term: properties.current_term(),
            voted_for: properties.voted_for().cloned(),
            leader_id: properties.leader_id().cloned(),
            connected_peers: self.registry.connected_nodes(),
            since: self.raft.state_since(),
        }
    }

    fn shutdown(&mut self, io: &Io<'_>) {
        self.raft.stop();
        self.liveness.shutdown(io, &mut self.registry);
    }
}

enum Step {
    Network(NetworkEvent),
    Timer(TimerEvent),
    Poll,
    Stop,
}

/// One node's processing loop. See the module docs.
pub struct Shard {
    core: Core,
    transport: Arc<dyn Transport>,
    timers: TimerScheduler<TimerEvent>,
    fired: TimerReceiver<TimerEvent>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    handoff: mpsc::Receiver<ConnectionId>,
    status: watch::Sender<NodeStatus>,
    poll_interval: std::time::Duration,
}

impl Shard {
    /// Start the timer wheel and build the loop. Nothing runs until [`Shard::run`].
    pub fn new(
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        handoff: mpsc::Receiver<ConnectionId>,
        peer_events: broadcast::Sender<PeerEvent>,
    ) -> Result<(Self, watch::Receiver<NodeStatus>)> {
        let (timers, fired) = TimerScheduler::start(config.timer)?;
        let core = Core {
            raft: RaftNode::new(config),
            liveness: LivenessProtocol::new(config),
            registry: NodeRegistry::new(),
            peer_events,
        };
        let (status, status_rx) = watch::channel(core.status());
        let shard = Self {
            core,
            transport,
            timers,
            fired,
            events,
            handoff,
            status,
            poll_interval: config.poll_interval(),
        };
        Ok((shard, status_rx))
    }

    /// Run until `cancel` fires or a fatal error occurs. Non-fatal handler
    /// errors are logged and the loop carries on.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let result = self.run_loop(&cancel).await;
        let io = Io::new(self.transport.as_ref(), &self.timers);
        self.core.shutdown(&io);
        self.timers.shutdown();
        self.publish_status();
        tracing::info!(node_id = %self.core.raft.id(), "Shard stopped");
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        {
            let io = Io::new(self.transport.as_ref(), &self.timers);
            self.core.start(&io)?;
        }
        self.publish_status();

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.drain_handoff()?;

            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                task = self.fired.recv() => match task {
                    Some(task) => Step::Timer(task.payload),
                    None => return Err(CoordError::SchedulerStopped),
                },
                event = self.events.recv() => match event {
                    Some(event) => Step::Network(event),
                    None => return Err(CoordError::ChannelClosed("network events")),
                },
                _ = poll.tick() => Step::Poll,
            };

            let io = Io::new(self.transport.as_ref(), &self.timers);
            let outcome = match step {
                Step::Stop => {
                    tracing::info!(node_id = %self.core.raft.id(), "Shutdown requested");
                    return Ok(());
                }
                Step::Timer(event) => self.core.on_timer(&io, event),
                Step::Network(event) => self.core.on_network(&io, event),
                Step::Poll => Ok(()),
            };
            check(self.core.raft.id(), outcome)?;
            self.publish_status();
        }
    }

    fn drain_handoff(&mut self) -> Result<()> {
        while let Ok(conn) = self.handoff.try_recv() {
            let io = Io::new(self.transport.as_ref(), &self.timers);
            let outcome = self.core.on_accepted(&io, conn);
            check(self.core.raft.id(), outcome)?;
        }
        Ok(())
    }

    fn publish_status(&self) {
        let next = self.core.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Propagate fatal errors, log the rest.
fn check(node_id: &str, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            tracing::error!(node_id, error = %e, "Fatal error, stopping shard");
            Err(e)
        }
        Err(e) => {
            tracing::warn!(node_id, error = %e, "Handler failed");
            Ok(())
        }
    }
}
