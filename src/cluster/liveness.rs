use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::registry::{Identified, NodeRegistry};
use crate::config::{NodeConfig, NodeId, PeerConfig};
use crate::error::Result;
use crate::event::{Io, PeerEvent, TimerEvent};
use crate::message::{Request, Response};
use crate::network::ConnectionId;
use crate::timer::TaskHandle;

/// Timers attached to one identified peer.
struct PeerLink {
    conn: ConnectionId,
    /// Present on the dialing side only.
    keepalive: Option<TaskHandle>,
    timeout: Option<TaskHandle>,
}

impl PeerLink {
    fn cancel(&self) {
        if let Some(task) = &self.keepalive {
            task.cancel();
        }
        if let Some(task) = &self.timeout {
            task.cancel();
        }
    }
}

/// Outbound connection waiting for the peer to confirm its identity.
struct PendingDial {
    node_id: NodeId,
    timeout: TaskHandle,
}

/// Connection-level heartbeat protocol.
///
/// The dialing side opens the connection, identifies itself with a
/// heartbeat request and then keeps the connection alive with one request
/// per heartbeat interval. Both sides drop a peer whose heartbeats stop for
/// longer than the heartbeat timeout, and the dialing side keeps redialling
/// it.
pub struct LivenessProtocol {
    node_id: NodeId,
    /// Peers this node connects to; the others connect to us.
    dial_targets: Vec<PeerConfig>,
    members: HashSet<NodeId>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    links: HashMap<NodeId, PeerLink>,
    dialing: HashMap<ConnectionId, PendingDial>,
    in_flight: HashSet<NodeId>,
    reconnecting: HashMap<NodeId, TaskHandle>,
    anonymous: HashMap<ConnectionId, TaskHandle>,
}

impl LivenessProtocol {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            dial_targets: config.dial_targets().cloned().collect(),
            members: config.peers.iter().map(|p| p.node_id.clone()).collect(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            links: HashMap::new(),
            dialing: HashMap::new(),
            in_flight: HashSet::new(),
            reconnecting: HashMap::new(),
            anonymous: HashMap::new(),
        }
    }

    /// Dial every peer this node is responsible for.
    pub fn start(&mut self, io: &Io<'_>) {
        let targets: Vec<NodeId> = self.dial_targets.iter().map(|p| p.node_id.clone()).collect();
        for node_id in targets {
            self.dial(io, &node_id);
        }
    }

    fn dial(&mut self, io: &Io<'_>, node_id: &str) {
        let Some(peer) = self.dial_targets.iter().find(|p| p.node_id == node_id) else {
            return;
        };
        if !self.in_flight.insert(node_id.to_string()) {
            return;
        }
        tracing::debug!(node_id = %self.node_id, peer_id = node_id, addr = %peer.addr(), "Connecting to peer");
        io.transport.connect(peer);
    }

    /// An outbound connection is up. Identify ourselves and wait for the
    /// answer.
    pub fn on_outbound_connected(&mut self, io: &Io<'_>, conn: ConnectionId, node_id: &str) -> Result<()> {
        self.in_flight.remove(node_id);
        let timeout = io.schedule(self.heartbeat_timeout, TimerEvent::ConnectionTimeout { conn })?;
        self.dialing.insert(
            conn,
            PendingDial {
                node_id: node_id.to_string(),
                timeout,
            },
        );
        io.send(
            conn,
            Request::Heartbeat {
                node_id: self.node_id.clone(),
            },
        );
        Ok(())
    }

    pub fn on_connect_failed(&mut self, io: &Io<'_>, node_id: &str) -> Result<()> {
        self.in_flight.remove(node_id);
        tracing::warn!(node_id = %self.node_id, peer_id = node_id, "Failed to connect to peer");
        self.schedule_reconnect(io, node_id)
    }

    /// A connection was accepted and handed off. It stays anonymous until
    /// its first heartbeat request, for at most one heartbeat timeout.
    pub fn on_accepted(&mut self, io: &Io<'_>, registry: &mut NodeRegistry, conn: ConnectionId) -> Result<()> {
        // Its first request may already have been processed.
        if registry.node_for(&conn).is_some() {
            return Ok(());
        }
        registry.add_anonymous(conn);
        let timeout = io.schedule(self.heartbeat_timeout, TimerEvent::ConnectionTimeout { conn })?;
        if let Some(previous) = self.anonymous.insert(conn, timeout) {
            previous.cancel();
        }
        Ok(())
    }

    /// A peer sent a heartbeat request. The first one on a connection binds
    /// the connection to the sender's id.
    pub fn on_heartbeat_request(
        &mut self,
        io: &Io<'_>,
        registry: &mut NodeRegistry,
        conn: ConnectionId,
        node_id: &str,
    ) -> Result<Option<PeerEvent>> {
        let already_bound = registry.node_for(&conn).map(|id| id == node_id);
        let event = match already_bound {
            Some(true) => None,
            Some(false) => {
                tracing::warn!(
                    node_id = %self.node_id,
                    claimed = node_id,
                    conn = %conn,
                    "Heartbeat identity changed on an identified connection, closing it"
                );
                io.close(conn);
                return self.on_connection_closed(io, registry, conn);
            }
            None => {
                if !self.members.contains(node_id) {
                    tracing::warn!(
                        node_id = %self.node_id,
                        claimed = node_id,
                        conn = %conn,
                        "Heartbeat from a node outside the cluster, closing connection"
                    );
                    if let Some(task) = self.anonymous.remove(&conn) {
                        task.cancel();
                    }
                    registry.remove_connection(&conn);
                    io.close(conn);
                    return Ok(None);
                }
                if let Some(task) = self.anonymous.remove(&conn) {
                    task.cancel();
                }
                self.identify(io, registry, conn, node_id, false)?
            }
        };

        self.refresh_timeout(io, node_id, conn)?;
        io.send(conn, Response::Heartbeat);
        Ok(event)
    }

    /// A heartbeat response arrived. On a pending outbound connection this
    /// completes the handshake; afterwards it is just proof of life.
    pub fn on_heartbeat_response(
        &mut self,
        io: &Io<'_>,
        registry: &mut NodeRegistry,
        conn: ConnectionId,
    ) -> Result<Option<PeerEvent>> {
        if let Some(pending) = self.dialing.remove(&conn) {
            pending.timeout.cancel();
            let event = self.identify(io, registry, conn, &pending.node_id, true)?;
            self.refresh_timeout(io, &pending.node_id, conn)?;
            return Ok(event);
        }

        match registry.node_for(&conn).cloned() {
            Some(node_id) => {
                self.refresh_timeout(io, &node_id, conn)?;
            }
            None => {
                tracing::trace!(node_id = %self.node_id, conn = %conn, "Heartbeat response on unknown connection");
            }
        }
        Ok(None)
    }

    /// Bind `conn` to `node_id`, replacing any older connection.
    fn identify(
        &mut self,
        io: &Io<'_>,
        registry: &mut NodeRegistry,
        conn: ConnectionId,
        node_id: &str,
        dialer: bool,
    ) -> Result<Option<PeerEvent>> {
        // A peer may identify itself on our outbound connection before it
        // answers our own handshake.
        let dialer = match self.dialing.remove(&conn) {
            Some(pending) => {
                pending.timeout.cancel();
                true
            }
            None => dialer,
        };
        let event = match registry.upsert(node_id, conn) {
            Identified::New => {
                tracing::info!(node_id = %self.node_id, peer_id = node_id, conn = %conn, "Peer connected");
                Some(PeerEvent::Connected(node_id.to_string()))
            }
            Identified::Unchanged => None,
            Identified::Replaced(previous) => {
                tracing::info!(
                    node_id = %self.node_id,
                    peer_id = node_id,
                    previous = %previous,
                    conn = %conn,
                    "Duplicate connection for peer, closing the older one"
                );
                io.close(previous);
                None
            }
        };

        if let Some(old) = self.links.remove(node_id) {
            old.cancel();
        }
        let keepalive = if dialer {
            Some(io.schedule_recurring(
                self.heartbeat_interval,
                TimerEvent::PeerKeepAlive {
                    node_id: node_id.to_string(),
                },
            )?)
        } else {
            None
        };
        self.links.insert(
            node_id.to_string(),
            PeerLink {
                conn,
                keepalive,
                timeout: None,
            },
        );
        if let Some(task) = self.reconnecting.remove(node_id) {
            task.cancel();
        }
        Ok(event)
    }

    /// Periodic keep-alive on the dialing side.
    pub fn on_keepalive(&mut self, io: &Io<'_>, node_id: &str) -> Result<()> {
        let Some(link) = self.links.get(node_id) else {
            return Ok(());
        };
        let conn = link.conn;
        let armed = link.timeout.as_ref().is_some_and(|t| !t.is_cancelled());
        io.send(
            conn,
            Request::Heartbeat {
                node_id: self.node_id.clone(),
            },
        );
        if !armed {
            self.refresh_timeout(io, node_id, conn)?;
        }
        Ok(())
    }

    /// The heartbeat timeout armed for `conn` fired. Does nothing if the
    /// peer has moved to another connection since.
    pub fn on_peer_timeout(
        &mut self,
        io: &Io<'_>,
        registry: &mut NodeRegistry,
        node_id: &str,
        conn: ConnectionId,
    ) -> Result<Option<PeerEvent>> {
        if !registry.remove_if_current(node_id, conn) {
            return Ok(None);
        }
        tracing::warn!(
            node_id = %self.node_id,
            peer_id = node_id,
            timeout_ms = self.heartbeat_timeout.as_millis() as u64,
            "Peer heartbeat timed out, dropping connection"
        );
        if let Some(link) = self.links.remove(node_id) {
            link.cancel();
        }
        io.close(conn);
        self.schedule_reconnect(io, node_id)?;
        Ok(Some(PeerEvent::Disconnected(node_id.to_string())))
    }

    /// A connection that never identified itself timed out.
    pub fn on_connection_timeout(&mut self, io: &Io<'_>, registry: &mut NodeRegistry, conn: ConnectionId) -> Result<()> {
        if let Some(pending) = self.dialing.remove(&conn) {
            tracing::warn!(
                node_id = %self.node_id,
                peer_id = %pending.node_id,
                "Peer did not answer the handshake, closing connection"
            );
            io.close(conn);
            return self.schedule_reconnect(io, &pending.node_id);
        }
        self.anonymous.remove(&conn);
        if registry.remove_anonymous(&conn) {
            tracing::debug!(node_id = %self.node_id, conn = %conn, "Anonymous connection expired");
            io.close(conn);
        }
        Ok(())
    }

    /// The remote side closed `conn`.
    pub fn on_connection_closed(
        &mut self,
        io: &Io<'_>,
        registry: &mut NodeRegistry,
        conn: ConnectionId,
    ) -> Result<Option<PeerEvent>> {
        if let Some(pending) = self.dialing.remove(&conn) {
            pending.timeout.cancel();
            self.schedule_reconnect(io, &pending.node_id)?;
            return Ok(None);
        }
        if let Some(task) = self.anonymous.remove(&conn) {
            task.cancel();
        }
        let Some(node_id) = registry.remove_connection(&conn) else {
            return Ok(None);
        };
        tracing::info!(node_id = %self.node_id, peer_id = %node_id, "Peer connection closed");
        if let Some(link) = self.links.remove(&node_id) {
            link.cancel();
        }
        self.schedule_reconnect(io, &node_id)?;
        Ok(Some(PeerEvent::Disconnected(node_id)))
    }

    /// Redial after one heartbeat interval, if this node is the dialing side.
    fn schedule_reconnect(&mut self, io: &Io<'_>, node_id: &str) -> Result<()> {
        let dials = self.dial_targets.iter().any(|p| p.node_id == node_id);
        if !dials || self.reconnecting.contains_key(node_id) {
            return Ok(());
        }
        let task = io.schedule(
            self.heartbeat_interval,
            TimerEvent::Reconnect {
                node_id: node_id.to_string(),
            },
        )?;
        self.reconnecting.insert(node_id.to_string(), task);
        Ok(())
    }

    pub fn on_reconnect(&mut self, io: &Io<'_>, registry: &NodeRegistry, node_id: &str) {
        self.reconnecting.remove(node_id);
        let handshaking = self.dialing.values().any(|p| p.node_id == node_id);
        if registry.is_connected(node_id) || handshaking {
            return;
        }
        self.dial(io, node_id);
    }

    /// Cancel the pending timeout for `node_id` and arm a fresh one.
    fn refresh_timeout(&mut self, io: &Io<'_>, node_id: &str, conn: ConnectionId) -> Result<()> {
        let Some(link) = self.links.get_mut(node_id) else {
            return Ok(());
        };
        if link.conn != conn {
            return Ok(());
        }
        if let Some(previous) = link.timeout.take() {
            previous.cancel();
        }
        link.timeout = Some(io.schedule(
            self.heartbeat_timeout,
            TimerEvent::PeerTimeout {
                node_id: node_id.to_string(),
                conn,
            },
        )?);
        Ok(())
    }

    /// Close every connection and cancel every timer.
    pub fn shutdown(&mut self, io: &Io<'_>, registry: &mut NodeRegistry) {
        for (_, link) in self.links.drain() {
            link.cancel();
            io.close(link.conn);
        }
        for (conn, pending) in self.dialing.drain() {
            pending.timeout.cancel();
            io.close(conn);
        }
        for (conn, task) in self.anonymous.drain() {
            task.cancel();
            io.close(conn);
        }
        for (_, task) in self.reconnecting.drain() {
            task.cancel();
        }
        let identified: Vec<ConnectionId> = registry.connections().map(|(_, conn)| conn).collect();
        for conn in identified {
            registry.remove_connection(&conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerConfig;
    use crate::message::Message;
    use crate::network::Transport;
    use crate::timer::{TimerReceiver, TimerScheduler};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(ConnectionId, Message)>>,
        dialed: Mutex<Vec<NodeId>>,
        closed: Mutex<Vec<ConnectionId>>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, conn: ConnectionId, message: Message) {
            self.sent.lock().push((conn, message));
        }
        fn connect(&self, peer: &PeerConfig) {
            self.dialed.lock().push(peer.node_id.clone());
        }
        fn close(&self, conn: ConnectionId) {
            self.closed.lock().push(conn);
        }
    }

    struct Fixture {
        liveness: LivenessProtocol,
        registry: NodeRegistry,
        transport: RecordingTransport,
        timers: TimerScheduler<TimerEvent>,
        _fired: TimerReceiver<TimerEvent>,
    }

    impl Fixture {
        /// Node "2" in a cluster of "1", "2" and "3": it dials "1" and is
        /// dialled by "3".
        fn new() -> Self {
            let config = NodeConfig::new("2", "memory", 0)
                .with_peer("1", "memory", 0)
                .with_peer("3", "memory", 0);
            let (timers, fired) = TimerScheduler::start(TimerConfig::default()).unwrap();
            Self {
                liveness: LivenessProtocol::new(&config),
                registry: NodeRegistry::new(),
                transport: RecordingTransport::default(),
                timers,
                _fired: fired,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.timers.shutdown();
        }
    }

    #[test]
    fn dials_only_lower_ids() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        f.liveness.start(&io);
        f.liveness.start(&io);
        assert_eq!(*f.transport.dialed.lock(), vec!["1".to_string()]);
    }

    #[test]
    fn outbound_handshake_identifies_peer() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness.on_outbound_connected(&io, conn, "1").unwrap();
        assert_eq!(
            f.transport.sent.lock()[0],
            (conn, Message::from(Request::Heartbeat { node_id: "2".into() }))
        );
        assert!(!f.registry.is_connected("1"));

        let event = f
            .liveness
            .on_heartbeat_response(&io, &mut f.registry, conn)
            .unwrap();
        assert_eq!(event, Some(PeerEvent::Connected("1".into())));
        assert_eq!(f.registry.get("1"), Some(conn));
        assert!(f.liveness.links["1"].keepalive.is_some());
    }

    #[test]
    fn peer_request_on_outbound_connection_completes_handshake() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness.on_outbound_connected(&io, conn, "1").unwrap();

        let event = f
            .liveness
            .on_heartbeat_request(&io, &mut f.registry, conn, "1")
            .unwrap();
        assert_eq!(event, Some(PeerEvent::Connected("1".into())));
        assert!(f.liveness.dialing.is_empty());
        assert!(f.liveness.links["1"].keepalive.is_some());

        // The handshake timeout armed for the dial no longer applies.
        f.liveness
            .on_connection_timeout(&io, &mut f.registry, conn)
            .unwrap();
        assert!(f.transport.closed.lock().is_empty());
        assert_eq!(f.registry.get("1"), Some(conn));
        assert!(f.liveness.reconnecting.is_empty());
    }

    #[test]
    fn inbound_heartbeat_identifies_and_answers() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness.on_accepted(&io, &mut f.registry, conn).unwrap();
        assert!(f.registry.is_anonymous(&conn));

        let event = f
            .liveness
            .on_heartbeat_request(&io, &mut f.registry, conn, "3")
            .unwrap();
        assert_eq!(event, Some(PeerEvent::Connected("3".into())));
        assert!(!f.registry.is_anonymous(&conn));
        assert_eq!(
            f.transport.sent.lock().last(),
            Some(&(conn, Message::from(Response::Heartbeat)))
        );

        // Later requests are plain keep-alives.
        let event = f
            .liveness
            .on_heartbeat_request(&io, &mut f.registry, conn, "3")
            .unwrap();
        assert_eq!(event, None);
    }

    #[test]
    fn unknown_node_is_refused() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness.on_accepted(&io, &mut f.registry, conn).unwrap();
        let event = f
            .liveness
            .on_heartbeat_request(&io, &mut f.registry, conn, "9")
            .unwrap();
        assert_eq!(event, None);
        assert_eq!(f.registry.anonymous_count(), 0);
        assert_eq!(*f.transport.closed.lock(), vec![conn]);
    }

    #[test]
    fn duplicate_identity_closes_older_connection() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        f.liveness
            .on_heartbeat_request(&io, &mut f.registry, first, "3")
            .unwrap();
        let event = f
            .liveness
            .on_heartbeat_request(&io, &mut f.registry, second, "3")
            .unwrap();

        assert_eq!(event, None);
        assert_eq!(f.registry.get("3"), Some(second));
        assert_eq!(f.registry.connected_count(), 1);
        assert_eq!(*f.transport.closed.lock(), vec![first]);

        // The stale timeout of the first connection is a no-op.
        let event = f
            .liveness
            .on_peer_timeout(&io, &mut f.registry, "3", first)
            .unwrap();
        assert_eq!(event, None);
        assert!(f.registry.is_connected("3"));
    }

    #[test]
    fn timeout_disconnects_exactly_once() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness
            .on_heartbeat_request(&io, &mut f.registry, conn, "3")
            .unwrap();

        let first = f
            .liveness
            .on_peer_timeout(&io, &mut f.registry, "3", conn)
            .unwrap();
        let second = f
            .liveness
            .on_peer_timeout(&io, &mut f.registry, "3", conn)
            .unwrap();
        let closed = f
            .liveness
            .on_connection_closed(&io, &mut f.registry, conn)
            .unwrap();
        assert_eq!(first, Some(PeerEvent::Disconnected("3".into())));
        assert_eq!(second, None);
        assert_eq!(closed, None);
        // "3" dials us, so we do not redial it.
        assert!(f.liveness.reconnecting.is_empty());
    }

    #[test]
    fn dialer_reconnects_after_loss() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness.on_outbound_connected(&io, conn, "1").unwrap();
        f.liveness
            .on_heartbeat_response(&io, &mut f.registry, conn)
            .unwrap();

        let event = f
            .liveness
            .on_connection_closed(&io, &mut f.registry, conn)
            .unwrap();
        assert_eq!(event, Some(PeerEvent::Disconnected("1".into())));
        assert!(f.liveness.reconnecting.contains_key("1"));

        f.liveness.on_reconnect(&io, &f.registry, "1");
        assert_eq!(*f.transport.dialed.lock(), vec!["1".to_string()]);
    }

    #[test]
    fn anonymous_connection_expires() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        let conn = ConnectionId::new();
        f.liveness.on_accepted(&io, &mut f.registry, conn).unwrap();
        f.liveness
            .on_connection_timeout(&io, &mut f.registry, conn)
            .unwrap();
        assert_eq!(f.registry.anonymous_count(), 0);
        assert_eq!(*f.transport.closed.lock(), vec![conn]);
    }

    #[test]
    fn failed_connect_is_retried() {
        let mut f = Fixture::new();
        let io = Io::new(&f.transport, &f.timers);
        f.liveness.start(&io);
        f.liveness.on_connect_failed(&io, "1").unwrap();
        assert!(f.liveness.reconnecting.contains_key("1"));
        f.liveness.on_reconnect(&io, &f.registry, "1");
        assert_eq!(f.transport.dialed.lock().len(), 2);
    }
}
