use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::state::{MembershipState, RaftProperties, RaftRole};
use super::timer::ElectionTimeout;
use crate::cluster::NodeRegistry;
use crate::config::{NodeConfig, NodeId};
use crate::error::Result;
use crate::event::{Io, TimerEvent};
use crate::message::{Request, Response};
use crate::timer::TaskHandle;

/// Leader election state machine for one node.
///
/// Owned by a single shard and driven synchronously: every handler runs to
/// completion on the shard's loop, and side effects go out through [`Io`].
pub struct RaftNode {
    id: NodeId,
    properties: RaftProperties,
    state: MembershipState,
    state_since: DateTime<Utc>,
    election: ElectionTimeout,
    heartbeat_interval: Duration,
    election_task: Option<TaskHandle>,
    election_delay: Duration,
}

impl RaftNode {
    pub fn new(config: &NodeConfig) -> Self {
        let election = ElectionTimeout::from_config(config);
        Self {
            id: config.node_id.clone(),
            properties: RaftProperties::new(config.membership_size()),
            state: MembershipState::Follower,
            state_since: Utc::now(),
            election,
            heartbeat_interval: config.heartbeat_interval(),
            election_task: None,
            election_delay: election.max(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> RaftRole {
        self.state.role()
    }

    pub fn state(&self) -> &MembershipState {
        &self.state
    }

    /// When the current membership state was entered.
    pub fn state_since(&self) -> DateTime<Utc> {
        self.state_since
    }

    pub fn properties(&self) -> &RaftProperties {
        &self.properties
    }

    /// Log positions are owned by the log layer, which records them here.
    pub fn properties_mut(&mut self) -> &mut RaftProperties {
        &mut self.properties
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    /// Arm the first election timeout.
    pub fn start(&mut self, io: &Io<'_>) -> Result<()> {
        tracing::info!(
            node_id = %self.id,
            members = self.properties.membership_size(),
            quorum = self.properties.quorum(),
            "Raft node started"
        );
        self.reset_election_timeout(io, self.election.sample())
    }

    /// Enter the catch-up state. Only a follower can start syncing.
    pub fn begin_sync(&mut self) -> bool {
        if self.role() != RaftRole::Follower {
            return false;
        }
        self.transition_to(MembershipState::Sync);
        true
    }

    /// Leave the catch-up state.
    pub fn end_sync(&mut self) {
        if self.role() == RaftRole::Sync {
            self.transition_to(MembershipState::Follower);
        }
    }

    /// Handle a consensus request from the identified peer `from`.
    ///
    /// Returns the response to send back on the same connection, or `None`
    /// when the request deserves no answer.
    pub fn handle_request(
        &mut self,
        io: &Io<'_>,
        registry: &NodeRegistry,
        from: &str,
        request: &Request,
    ) -> Result<Option<Response>> {
        match (self.role(), request) {
            (_, Request::Heartbeat { .. }) => Ok(None),
            (
                _,
                Request::Vote {
                    term,
                    last_log_term,
                    last_log_index,
                },
            ) => self.handle_vote_request(io, from, *term, *last_log_term, *last_log_index),
            (RaftRole::Follower | RaftRole::Sync, Request::LeaderHeartbeat { term, node_id }) => {
                self.follower_leader_heartbeat(io, *term, node_id)
            }
            (RaftRole::Candidate, Request::LeaderHeartbeat { term, node_id }) => {
                self.candidate_leader_heartbeat(io, *term, node_id)
            }
            (RaftRole::Leader, Request::LeaderHeartbeat { term, node_id }) => {
                self.leader_leader_heartbeat(io, registry, *term, node_id)
            }
        }
    }

    /// Handle a consensus response from the identified peer `from`.
    pub fn handle_response(
        &mut self,
        io: &Io<'_>,
        registry: &NodeRegistry,
        from: &str,
        response: &Response,
    ) -> Result<()> {
        match response {
            Response::Heartbeat => Ok(()),
            Response::Vote { term, granted } => {
                self.handle_vote_response(io, registry, from, *term, *granted)
            }
            Response::LeaderHeartbeat { term, accepted } => {
                if self.step_down_if_newer(io, *term)? {
                    return Ok(());
                }
                if !accepted {
                    tracing::debug!(
                        node_id = %self.id,
                        peer_id = from,
                        term,
                        "Leader heartbeat rejected"
                    );
                }
                Ok(())
            }
        }
    }

    /// Handle a timer event that belongs to the state machine.
    pub fn handle_timer(&mut self, io: &Io<'_>, registry: &NodeRegistry, event: &TimerEvent) -> Result<()> {
        match event {
            TimerEvent::ElectionTimeout => self.on_election_timeout(io, registry),
            TimerEvent::LeaderHeartbeat => self.on_leader_heartbeat(io, registry),
            _ => Ok(()),
        }
    }

    /// A peer identified itself. A leader asserts itself right away instead
    /// of making the newcomer wait for the next heartbeat.
    pub fn on_peer_connected(&mut self, io: &Io<'_>, registry: &NodeRegistry, node_id: &str) {
        if !self.is_leader() {
            return;
        }
        if let Some(conn) = registry.get(node_id) {
            io.send(conn, self.leader_heartbeat_request());
        }
    }

    /// A peer was removed from the registry. A leader that can no longer
    /// reach a majority steps down.
    pub fn on_peer_disconnected(&mut self, io: &Io<'_>, registry: &NodeRegistry) -> Result<()> {
        if self.is_leader() && !self.has_quorum(registry) {
            self.step_down_lost_quorum(io, registry)?;
        }
        Ok(())
    }

    fn handle_vote_request(
        &mut self,
        io: &Io<'_>,
        candidate: &str,
        term: u64,
        last_log_term: u64,
        last_log_index: u64,
    ) -> Result<Option<Response>> {
        let current_term = self.properties.current_term();
        if term <= current_term || !self.properties.is_log_up_to_date(last_log_term, last_log_index) {
            tracing::debug!(
                node_id = %self.id,
                candidate,
                term,
                current_term,
                "Vote denied"
            );
            return Ok(Some(Response::Vote {
                term: current_term,
                granted: false,
            }));
        }

        self.properties.advance_term(term);
        self.properties.vote_for(candidate);
        if matches!(self.role(), RaftRole::Candidate | RaftRole::Leader) {
            self.transition_to(MembershipState::Follower);
        }
        tracing::info!(node_id = %self.id, candidate, term, "Vote granted");

        // Give the candidate the longest window to finish its round.
        self.reset_election_timeout(io, self.election.max())?;
        Ok(Some(Response::Vote { term, granted: true }))
    }

    fn follower_leader_heartbeat(&mut self, io: &Io<'_>, term: u64, leader: &str) -> Result<Option<Response>> {
        let current_term = self.properties.current_term();
        if term < current_term {
            return Ok(Some(self.reject_stale_leader(leader, term)));
        }

        if term > current_term {
            self.properties.advance_term(term);
            self.accept_leader(leader, term);
        } else {
            match self.properties.leader_id().cloned() {
                Some(known) if known == leader => {}
                Some(known) => {
                    tracing::error!(
                        node_id = %self.id,
                        term,
                        known_leader = %known,
                        claimed_leader = leader,
                        "Two leaders claim the same term"
                    );
                    return Ok(None);
                }
                None => self.accept_leader(leader, term),
            }
        }

        self.reset_election_timeout(io, self.election.sample())?;
        Ok(Some(Response::LeaderHeartbeat { term, accepted: true }))
    }

    fn candidate_leader_heartbeat(&mut self, io: &Io<'_>, term: u64, leader: &str) -> Result<Option<Response>> {
        if term < self.properties.current_term() {
            return Ok(Some(self.reject_stale_leader(leader, term)));
        }

        // Someone won this term or a later one.
        self.properties.advance_term(term);
        self.accept_leader(leader, term);
        self.transition_to(MembershipState::Follower);
        self.reset_election_timeout(io, self.election.sample())?;
        Ok(Some(Response::LeaderHeartbeat { term, accepted: true }))
    }

    fn leader_leader_heartbeat(
        &mut self,
        io: &Io<'_>,
        registry: &NodeRegistry,
        term: u64,
        leader: &str,
    ) -> Result<Option<Response>> {
        let current_term = self.properties.current_term();
        if term < current_term {
            let response = self.reject_stale_leader(leader, term);
            // Let the stale leader learn about us right away.
            if let Some(conn) = registry.get(leader) {
                io.send(conn, self.leader_heartbeat_request());
            }
            return Ok(Some(response));
        }
        if term == current_term {
            tracing::error!(
                node_id = %self.id,
                term,
                claimed_leader = leader,
                "Another node claims leadership of our term"
            );
            return Ok(None);
        }

        self.properties.advance_term(term);
        self.accept_leader(leader, term);
        self.transition_to(MembershipState::Follower);
        self.reset_election_timeout(io, self.election.sample())?;
        Ok(Some(Response::LeaderHeartbeat { term, accepted: true }))
    }

    fn handle_vote_response(
        &mut self,
        io: &Io<'_>,
        registry: &NodeRegistry,
        from: &str,
        term: u64,
        granted: bool,
    ) -> Result<()> {
        if self.step_down_if_newer(io, term)? {
            return Ok(());
        }
        let current_term = self.properties.current_term();
        let quorum = self.properties.quorum();
        let MembershipState::Candidate { votes } = &mut self.state else {
            tracing::trace!(node_id = %self.id, peer_id = from, term, "Vote response outside an election");
            return Ok(());
        };
        if term != current_term || !granted {
            tracing::debug!(node_id = %self.id, peer_id = from, term, granted, "Vote not counted");
            return Ok(());
        }

        votes.insert(from.to_string());
        let vote_count = votes.len();
        tracing::debug!(node_id = %self.id, peer_id = from, votes = vote_count, "Received vote");
        if vote_count >= quorum {
            self.become_leader(io, registry, vote_count)?;
        }
        Ok(())
    }

    fn on_election_timeout(&mut self, io: &Io<'_>, registry: &NodeRegistry) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }

        let connected = registry.connected_count();
        let members = self.properties.membership_size();
        if connected + 1 > members / 2 {
            tracing::info!(
                node_id = %self.id,
                elapsed_ms = self.election_delay.as_millis() as u64,
                "Election timeout, starting election"
            );
            return self.start_election(io, registry);
        }

        tracing::debug!(
            node_id = %self.id,
            connected,
            members,
            "Election timeout, too few peers connected to campaign"
        );
        if self.role() == RaftRole::Candidate {
            self.transition_to(MembershipState::Follower);
        }
        self.reset_election_timeout(io, self.election_delay)
    }

    /// Start a new election
    fn start_election(&mut self, io: &Io<'_>, registry: &NodeRegistry) -> Result<()> {
        let term = self.properties.increment_term();
        self.properties.vote_for(&self.id);
        let mut votes = BTreeSet::new();
        votes.insert(self.id.clone());
        self.transition_to(MembershipState::Candidate { votes });

        tracing::info!(node_id = %self.id, term, "Starting election");

        let request = Request::Vote {
            term,
            last_log_term: self.properties.last_log_term(),
            last_log_index: self.properties.last_log_index(),
        };
        for (_, conn) in registry.connections() {
            io.send(conn, request.clone());
        }

        self.reset_election_timeout(io, self.election.sample())?;

        // A cluster of one wins on its own vote.
        if self.properties.quorum() <= 1 {
            self.become_leader(io, registry, 1)?;
        }
        Ok(())
    }

    fn become_leader(&mut self, io: &Io<'_>, registry: &NodeRegistry, votes: usize) -> Result<()> {
        if let Some(task) = self.election_task.take() {
            task.cancel();
        }
        let heartbeat = io.schedule_recurring(self.heartbeat_interval, TimerEvent::LeaderHeartbeat)?;
        self.properties.set_leader(Some(self.id.clone()));
        self.transition_to(MembershipState::Leader { heartbeat });

        tracing::info!(
            node_id = %self.id,
            term = self.properties.current_term(),
            votes,
            "Became leader"
        );
        self.broadcast_leader_heartbeat(io, registry);
        Ok(())
    }

    fn on_leader_heartbeat(&mut self, io: &Io<'_>, registry: &NodeRegistry) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        if !self.has_quorum(registry) {
            return self.step_down_lost_quorum(io, registry);
        }
        self.broadcast_leader_heartbeat(io, registry);
        Ok(())
    }

    fn broadcast_leader_heartbeat(&self, io: &Io<'_>, registry: &NodeRegistry) {
        let request = self.leader_heartbeat_request();
        for (_, conn) in registry.connections() {
            io.send(conn, request.clone());
        }
    }

    fn leader_heartbeat_request(&self) -> Request {
        Request::LeaderHeartbeat {
            term: self.properties.current_term(),
            node_id: self.id.clone(),
        }
    }

    fn has_quorum(&self, registry: &NodeRegistry) -> bool {
        registry.connected_count() + 1 >= self.properties.quorum()
    }

    fn step_down_lost_quorum(&mut self, io: &Io<'_>, registry: &NodeRegistry) -> Result<()> {
        tracing::warn!(
            node_id = %self.id,
            term = self.properties.current_term(),
            connected = registry.connected_count(),
            quorum = self.properties.quorum(),
            "Lost quorum, stepping down"
        );
        self.properties.set_leader(None);
        self.transition_to(MembershipState::Follower);
        self.reset_election_timeout(io, self.election.sample())
    }

    /// Adopt a newer term seen in a response. Returns `true` if we stepped down.
    fn step_down_if_newer(&mut self, io: &Io<'_>, term: u64) -> Result<bool> {
        if !self.properties.advance_term(term) {
            return Ok(false);
        }
        tracing::info!(node_id = %self.id, term, "Higher term seen, becoming follower");
        if !matches!(self.role(), RaftRole::Follower | RaftRole::Sync) {
            self.transition_to(MembershipState::Follower);
        }
        self.reset_election_timeout(io, self.election.sample())?;
        Ok(true)
    }

    fn accept_leader(&mut self, leader: &str, term: u64) {
        tracing::info!(node_id = %self.id, leader_id = leader, term, "Accepted new leader");
        self.properties.set_leader(Some(leader.to_string()));
    }

    fn reject_stale_leader(&self, leader: &str, term: u64) -> Response {
        let current_term = self.properties.current_term();
        tracing::debug!(
            node_id = %self.id,
            leader_id = leader,
            term,
            current_term,
            "Rejected stale leader heartbeat"
        );
        Response::LeaderHeartbeat {
            term: current_term,
            accepted: false,
        }
    }

    fn reset_election_timeout(&mut self, io: &Io<'_>, delay: Duration) -> Result<()> {
        if let Some(task) = self.election_task.take() {
            task.cancel();
        }
        self.election_task = Some(io.schedule(delay, TimerEvent::ElectionTimeout)?);
        self.election_delay = delay;
        Ok(())
    }

    fn transition_to(&mut self, next: MembershipState) {
        let from = self.role();
        let previous = std::mem::replace(&mut self.state, next);
        previous.release();
        self.state_since = Utc::now();
        let to = self.role();
        if from != to {
            tracing::info!(
                node_id = %self.id,
                from = %from,
                to = %to,
                term = self.properties.current_term(),
                "Role changed"
            );
        }
    }

    /// Cancel every timer the state machine owns.
    pub fn stop(&mut self) {
        if let Some(task) = self.election_task.take() {
            task.cancel();
        }
        self.state.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerConfig;
    use crate::message::Message;
    use crate::network::{ConnectionId, Transport};
    use crate::timer::{TimerReceiver, TimerScheduler};
    use crate::config::PeerConfig;
    use parking_lot::Mutex;

    /// Records every send instead of delivering it.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(ConnectionId, Message)>>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<(ConnectionId, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, conn: ConnectionId, message: Message) {
            self.sent.lock().push((conn, message));
        }
        fn connect(&self, _peer: &PeerConfig) {}
        fn close(&self, _conn: ConnectionId) {}
    }

    struct Fixture {
        node: RaftNode,
        registry: NodeRegistry,
        transport: RecordingTransport,
        timers: TimerScheduler<TimerEvent>,
        _fired: TimerReceiver<TimerEvent>,
    }

    impl Fixture {
        fn new(node_id: &str, peers: &[&str]) -> Self {
            let mut config = NodeConfig::new(node_id, "memory", 0);
            for peer in peers {
                config = config.with_peer(*peer, "memory", 0);
            }
            let (timers, fired) = TimerScheduler::start(TimerConfig::default()).unwrap();
            Self {
                node: RaftNode::new(&config),
                registry: NodeRegistry::new(),
                transport: RecordingTransport::default(),
                timers,
                _fired: fired,
            }
        }

        fn connect(&mut self, peers: &[&str]) {
            for peer in peers {
                self.registry.upsert(peer, ConnectionId::new());
            }
        }

        fn request(&mut self, from: &str, request: Request) -> Option<Response> {
            let io = Io::new(&self.transport, &self.timers);
            self.node
                .handle_request(&io, &self.registry, from, &request)
                .unwrap()
        }

        fn respond(&mut self, from: &str, response: Response) {
            let io = Io::new(&self.transport, &self.timers);
            self.node
                .handle_response(&io, &self.registry, from, &response)
                .unwrap();
        }

        fn fire(&mut self, event: TimerEvent) {
            let io = Io::new(&self.transport, &self.timers);
            self.node.handle_timer(&io, &self.registry, &event).unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.timers.shutdown();
        }
    }

    fn vote(term: u64, last_log_term: u64, last_log_index: u64) -> Request {
        Request::Vote {
            term,
            last_log_term,
            last_log_index,
        }
    }

    #[test]
    fn grants_vote_for_newer_term_and_log() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.node.properties_mut().advance_term(5);
        f.node.properties_mut().record_log(5, 10);

        let response = f.request("2", vote(6, 5, 10));
        assert_eq!(response, Some(Response::Vote { term: 6, granted: true }));
        assert_eq!(f.node.properties().current_term(), 6);
        assert_eq!(f.node.properties().voted_for().map(String::as_str), Some("2"));
    }

    #[test]
    fn votes_once_per_term() {
        let mut f = Fixture::new("1", &["2", "3"]);
        assert_eq!(
            f.request("2", vote(1, 0, 0)),
            Some(Response::Vote { term: 1, granted: true })
        );
        assert_eq!(
            f.request("3", vote(1, 0, 0)),
            Some(Response::Vote { term: 1, granted: false })
        );
    }

    #[test]
    fn denies_vote_for_stale_log() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.node.properties_mut().record_log(3, 7);
        assert_eq!(
            f.request("2", vote(4, 2, 100)),
            Some(Response::Vote { term: 0, granted: false })
        );
        assert_eq!(f.node.properties().current_term(), 0);
    }

    #[test]
    fn follower_rejects_stale_leader_heartbeat() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.node.properties_mut().advance_term(4);
        let response = f.request(
            "2",
            Request::LeaderHeartbeat {
                term: 3,
                node_id: "2".into(),
            },
        );
        assert_eq!(
            response,
            Some(Response::LeaderHeartbeat { term: 4, accepted: false })
        );
        assert!(f.node.properties().leader_id().is_none());
    }

    #[test]
    fn follower_accepts_newer_leader() {
        let mut f = Fixture::new("1", &["2", "3"]);
        let response = f.request(
            "3",
            Request::LeaderHeartbeat {
                term: 2,
                node_id: "3".into(),
            },
        );
        assert_eq!(
            response,
            Some(Response::LeaderHeartbeat { term: 2, accepted: true })
        );
        assert_eq!(f.node.properties().leader_id().map(String::as_str), Some("3"));
        assert_eq!(f.node.role(), RaftRole::Follower);
    }

    #[test]
    fn conflicting_leaders_in_one_term_get_no_answer() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.request("2", Request::LeaderHeartbeat { term: 2, node_id: "2".into() });
        let response = f.request("3", Request::LeaderHeartbeat { term: 2, node_id: "3".into() });
        assert_eq!(response, None);
        assert_eq!(f.node.properties().leader_id().map(String::as_str), Some("2"));
    }

    #[test]
    fn election_needs_connected_majority() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.fire(TimerEvent::ElectionTimeout);
        assert_eq!(f.node.role(), RaftRole::Follower);
        assert_eq!(f.node.properties().current_term(), 0);

        f.connect(&["2"]);
        f.fire(TimerEvent::ElectionTimeout);
        assert_eq!(f.node.role(), RaftRole::Candidate);
        assert_eq!(f.node.properties().current_term(), 1);
        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Message::from(vote(1, 0, 0)));
    }

    #[test]
    fn candidate_wins_with_majority_and_asserts_leadership() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.connect(&["2", "3"]);
        f.fire(TimerEvent::ElectionTimeout);
        f.transport.take();

        f.respond("2", Response::Vote { term: 1, granted: true });
        assert!(f.node.is_leader());
        assert_eq!(f.node.properties().leader_id().map(String::as_str), Some("1"));

        let heartbeats = f.transport.take();
        assert_eq!(heartbeats.len(), 2);
        assert!(heartbeats.iter().all(|(_, msg)| *msg
            == Message::from(Request::LeaderHeartbeat { term: 1, node_id: "1".into() })));
    }

    #[test]
    fn denied_and_stale_votes_are_not_counted() {
        let mut f = Fixture::new("1", &["2", "3", "4", "5"]);
        f.connect(&["2", "3", "4", "5"]);
        f.fire(TimerEvent::ElectionTimeout);

        f.respond("2", Response::Vote { term: 1, granted: false });
        f.respond("3", Response::Vote { term: 0, granted: true });
        f.respond("4", Response::Vote { term: 1, granted: true });
        assert_eq!(f.node.role(), RaftRole::Candidate);
        f.respond("4", Response::Vote { term: 1, granted: true });
        assert_eq!(f.node.role(), RaftRole::Candidate);
        f.respond("5", Response::Vote { term: 1, granted: true });
        assert!(f.node.is_leader());
    }

    #[test]
    fn higher_term_response_forces_step_down() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.connect(&["2", "3"]);
        f.fire(TimerEvent::ElectionTimeout);
        f.respond("2", Response::Vote { term: 1, granted: true });
        assert!(f.node.is_leader());

        f.respond("3", Response::LeaderHeartbeat { term: 7, accepted: false });
        assert_eq!(f.node.role(), RaftRole::Follower);
        assert_eq!(f.node.properties().current_term(), 7);
    }

    /// Node "1" leading term 1 of cluster {1, 2, 3}.
    fn leader_fixture() -> Fixture {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.connect(&["2", "3"]);
        f.fire(TimerEvent::ElectionTimeout);
        f.respond("2", Response::Vote { term: 1, granted: true });
        assert!(f.node.is_leader());
        f.transport.take();
        f
    }

    #[test]
    fn leader_ignores_same_term_claim() {
        let mut f = leader_fixture();
        let response = f.request("3", Request::LeaderHeartbeat { term: 1, node_id: "3".into() });
        assert_eq!(response, None);
        assert!(f.node.is_leader());
        assert_eq!(f.node.properties().leader_id().map(String::as_str), Some("1"));
    }

    #[test]
    fn leader_rejects_stale_leader_and_asserts_itself() {
        let mut f = leader_fixture();
        f.node.properties_mut().advance_term(3);
        f.node.properties_mut().set_leader(Some("1".into()));

        let response = f.request("2", Request::LeaderHeartbeat { term: 2, node_id: "2".into() });
        assert_eq!(
            response,
            Some(Response::LeaderHeartbeat { term: 3, accepted: false })
        );
        assert!(f.node.is_leader());

        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(Some(sent[0].0), f.registry.get("2"));
        assert_eq!(
            sent[0].1,
            Message::from(Request::LeaderHeartbeat { term: 3, node_id: "1".into() })
        );
    }

    #[test]
    fn leader_steps_down_for_newer_leader() {
        let mut f = leader_fixture();
        let heartbeat = match f.node.state() {
            MembershipState::Leader { heartbeat } => heartbeat.clone(),
            other => panic!("expected leader, got {:?}", other),
        };

        let response = f.request("3", Request::LeaderHeartbeat { term: 4, node_id: "3".into() });
        assert_eq!(
            response,
            Some(Response::LeaderHeartbeat { term: 4, accepted: true })
        );
        assert_eq!(f.node.role(), RaftRole::Follower);
        assert_eq!(f.node.properties().current_term(), 4);
        assert_eq!(f.node.properties().leader_id().map(String::as_str), Some("3"));
        assert!(heartbeat.is_cancelled());
    }

    #[test]
    fn granted_vote_rearms_longest_election_timeout() {
        let mut f = Fixture::new("1", &["2", "3"]);
        let io = Io::new(&f.transport, &f.timers);
        f.node.start(&io).unwrap();
        let first = f.node.election_task.clone().expect("election timeout armed");

        f.request("2", vote(1, 0, 0));
        assert!(first.is_cancelled());
        let rearmed = f.node.election_task.clone().expect("election timeout re-armed");
        assert!(!rearmed.is_cancelled());
        assert_eq!(f.node.election_delay, f.node.election.max());
    }

    #[test]
    fn candidate_yields_to_leader_of_same_term() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.connect(&["2", "3"]);
        f.fire(TimerEvent::ElectionTimeout);
        let response = f.request("2", Request::LeaderHeartbeat { term: 1, node_id: "2".into() });
        assert_eq!(
            response,
            Some(Response::LeaderHeartbeat { term: 1, accepted: true })
        );
        assert_eq!(f.node.role(), RaftRole::Follower);
    }

    #[test]
    fn leader_steps_down_when_quorum_is_lost() {
        let mut f = Fixture::new("1", &["2", "3"]);
        f.connect(&["2", "3"]);
        f.fire(TimerEvent::ElectionTimeout);
        f.respond("3", Response::Vote { term: 1, granted: true });
        let heartbeat = match f.node.state() {
            MembershipState::Leader { heartbeat } => heartbeat.clone(),
            other => panic!("expected leader, got {:?}", other),
        };

        let conn_2 = f.registry.get("2").unwrap();
        let conn_3 = f.registry.get("3").unwrap();
        f.registry.remove_connection(&conn_2);
        f.fire(TimerEvent::LeaderHeartbeat);
        assert!(f.node.is_leader());

        f.registry.remove_connection(&conn_3);
        let io = Io::new(&f.transport, &f.timers);
        f.node.on_peer_disconnected(&io, &f.registry).unwrap();
        assert_eq!(f.node.role(), RaftRole::Follower);
        assert!(heartbeat.is_cancelled());
    }

    #[test]
    fn single_node_elects_itself() {
        let mut f = Fixture::new("solo", &[]);
        f.fire(TimerEvent::ElectionTimeout);
        assert!(f.node.is_leader());
        assert_eq!(f.node.properties().current_term(), 1);
    }

    #[test]
    fn sync_handles_messages_like_follower() {
        let mut f = Fixture::new("1", &["2", "3"]);
        assert!(f.node.begin_sync());
        let response = f.request("2", Request::LeaderHeartbeat { term: 1, node_id: "2".into() });
        assert_eq!(
            response,
            Some(Response::LeaderHeartbeat { term: 1, accepted: true })
        );
        assert_eq!(f.node.role(), RaftRole::Sync);
        f.node.end_sync();
        assert_eq!(f.node.role(), RaftRole::Follower);
    }
}
