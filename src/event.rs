use std::time::Duration;

use serde::Serialize;

use crate::config::NodeId;
use crate::error::Result;
use crate::message::Message;
use crate::network::{ConnectionId, Transport};
use crate::timer::{TaskHandle, TimerScheduler};

/// Payload of every timer task scheduled by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// No leader heartbeat or vote grant within the election timeout.
    ElectionTimeout,
    /// Leader's periodic assertion of leadership.
    LeaderHeartbeat,
    /// Dialing side's periodic connection keep-alive.
    PeerKeepAlive { node_id: NodeId },
    /// No heartbeat traffic from an identified peer within the timeout.
    PeerTimeout { node_id: NodeId, conn: ConnectionId },
    /// An anonymous or still-handshaking connection never identified itself.
    ConnectionTimeout { conn: ConnectionId },
    Reconnect { node_id: NodeId },
}

/// Registry churn, as seen by the surrounding server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PeerEvent {
    Connected(NodeId),
    Disconnected(NodeId),
}

/// Outbound side effects available to the state machine and the liveness
/// protocol: sending on a connection and arming timers.
pub struct Io<'a> {
    pub transport: &'a dyn Transport,
    pub timers: &'a TimerScheduler<TimerEvent>,
}

impl<'a> Io<'a> {
    pub fn new(transport: &'a dyn Transport, timers: &'a TimerScheduler<TimerEvent>) -> Self {
        Self { transport, timers }
    }

    pub fn send(&self, conn: ConnectionId, message: impl Into<Message>) {
        self.transport.send(conn, message.into());
    }

    pub fn close(&self, conn: ConnectionId) {
        self.transport.close(conn);
    }

    pub fn schedule(&self, delay: Duration, event: TimerEvent) -> Result<TaskHandle> {
        self.timers.schedule_once(delay, event)
    }

    pub fn schedule_recurring(&self, period: Duration, event: TimerEvent) -> Result<TaskHandle> {
        self.timers.schedule_recurring(period, event)
    }
}
