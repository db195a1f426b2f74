use std::collections::HashSet;
use std::time::Duration;

use crate::error::{CoordError, Result};

/// Logical node identifier, e.g. `"1"` or `"name-server-a"`.
pub type NodeId = String;

/// Dimensions of the two-tier timer wheel.
///
/// The near wheel has `near_buckets` buckets of `tick_ms` each. The far wheel
/// has `far_buckets` buckets, each as wide as the whole near wheel, so the
/// wheels together span `tick_ms * near_buckets * far_buckets`.
///
/// The advance thread may run up to one tick behind the clock, which shifts
/// the far window by the same amount. Delays are therefore accepted up to
/// one tick short of the full span; see [`TimerConfig::max_delay_ms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub tick_ms: u64,
    pub near_buckets: usize,
    pub far_buckets: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            near_buckets: 60,
            far_buckets: 100,
        }
    }
}

impl TimerConfig {
    /// Time covered by one full rotation of the near wheel.
    pub fn near_span_ms(&self) -> u64 {
        self.tick_ms * self.near_buckets as u64
    }

    /// Time covered by both wheels.
    pub fn capacity_ms(&self) -> u64 {
        self.near_span_ms() * self.far_buckets as u64
    }

    /// Longest delay the scheduler accepts: the full span less one tick.
    pub fn max_delay_ms(&self) -> u64 {
        self.capacity_ms().saturating_sub(self.tick_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 || self.near_buckets == 0 || self.far_buckets == 0 {
            return Err(CoordError::InvalidConfig(
                "timer tick and bucket counts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Fails if `delay_ms` cannot be held by the wheels.
    pub fn check_delay(&self, delay_ms: u64) -> Result<()> {
        let capacity_ms = self.capacity_ms();
        if delay_ms > self.max_delay_ms() {
            return Err(CoordError::TimerCapacityExceeded {
                delay_ms,
                capacity_ms,
            });
        }
        Ok(())
    }
}

/// A cluster member, as supplied by static configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub hostname: String,
    pub port: u16,
}

impl PeerConfig {
    pub fn new(node_id: impl Into<NodeId>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Each pair of nodes has exactly one dialer: the node with the larger id
    /// connects to the one with the smaller id, and keeps redialling it.
    pub fn should_dial(&self, local_id: &str) -> bool {
        self.node_id.as_str() < local_id
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub peers: Vec<PeerConfig>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub timer: TimerConfig,
    /// Upper bound on how long the shard loop waits before draining the
    /// hand-off queue again.
    pub poll_interval_ms: u64,
    /// Capacity of the queue that hands accepted connections to the shard.
    pub handoff_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "1".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 9090,
            peers: Vec::new(),
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 10000,
            election_timeout_min_ms: 10000,
            election_timeout_max_ms: 20000,
            timer: TimerConfig::default(),
            poll_interval_ms: 500,
            handoff_capacity: 64,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: impl Into<NodeId>, hostname: impl Into<String>, port: u16) -> Self {
        self.peers.push(PeerConfig::new(node_id, hostname, port));
        self
    }

    /// Number of voting members, including this node.
    pub fn membership_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Peers this node is responsible for connecting to.
    pub fn dial_targets(&self) -> impl Iterator<Item = &PeerConfig> {
        self.peers.iter().filter(|p| p.should_dial(&self.node_id))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Check the configuration before anything is started.
    ///
    /// Timeouts that the timer wheel cannot represent are reported as
    /// [`CoordError::TimerCapacityExceeded`]: starting anyway would mean
    /// silently losing election or heartbeat timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(CoordError::InvalidConfig("node id must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(CoordError::InvalidConfig(format!(
                    "peer list contains the local node {}",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(CoordError::InvalidConfig(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }

        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(CoordError::InvalidConfig(format!(
                "election timeout min {}ms is above max {}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CoordError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(CoordError::InvalidConfig(format!(
                "heartbeat timeout {}ms must be longer than the interval {}ms",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.election_timeout_min_ms <= self.heartbeat_interval_ms {
            return Err(CoordError::InvalidConfig(format!(
                "election timeout {}ms must be longer than the heartbeat interval {}ms",
                self.election_timeout_min_ms, self.heartbeat_interval_ms
            )));
        }
        if self.handoff_capacity == 0 {
            return Err(CoordError::InvalidConfig(
                "hand-off queue capacity must be non-zero".to_string(),
            ));
        }

        self.timer.validate()?;
        for delay_ms in [
            self.heartbeat_interval_ms,
            self.heartbeat_timeout_ms,
            self.election_timeout_max_ms,
        ] {
            self.timer.check_delay(delay_ms)?;
        }
        Ok(())
    }
}
