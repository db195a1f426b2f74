use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::NodeId;
use crate::timer::TaskHandle;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    /// Catching up on log state. Handles messages like a follower.
    Sync,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
            RaftRole::Sync => write!(f, "sync"),
        }
    }
}

/// The node's current membership state, with the data that only exists in
/// that state. Replacing the value is the whole transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Follower,
    Candidate {
        /// Nodes that granted a vote in the current term, self included.
        votes: BTreeSet<NodeId>,
    },
    Leader {
        /// Recurring leader heartbeat, cancelled when leadership ends.
        heartbeat: TaskHandle,
    },
    Sync,
}

impl MembershipState {
    pub fn role(&self) -> RaftRole {
        match self {
            MembershipState::Follower => RaftRole::Follower,
            MembershipState::Candidate { .. } => RaftRole::Candidate,
            MembershipState::Leader { .. } => RaftRole::Leader,
            MembershipState::Sync => RaftRole::Sync,
        }
    }

    /// Release whatever the state holds on to.
    pub(crate) fn release(&self) {
        if let MembershipState::Leader { heartbeat } = self {
            heartbeat.cancel();
        }
    }
}

/// Term, vote and log positions of one node.
///
/// # Invariants
///
/// - `current_term` never decreases.
/// - `voted_for` refers to `current_term` and is cleared whenever the term
///   advances, so a node grants at most one vote per term.
/// - `last_applied <= last_committed_index <= last_log_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftProperties {
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    last_log_term: u64,
    last_log_index: u64,
    last_committed_term: u64,
    last_committed_index: u64,
    last_applied_index: u64,
    membership_size: usize,
}

impl RaftProperties {
    pub fn new(membership_size: usize) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            leader_id: None,
            last_log_term: 0,
            last_log_index: 0,
            last_committed_term: 0,
            last_committed_index: 0,
            last_applied_index: 0,
            membership_size: membership_size.max(1),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_log_index
    }

    pub fn last_committed_term(&self) -> u64 {
        self.last_committed_term
    }

    pub fn last_committed_index(&self) -> u64 {
        self.last_committed_index
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied_index
    }

    pub fn membership_size(&self) -> usize {
        self.membership_size
    }

    /// Votes needed to win an election.
    pub fn quorum(&self) -> usize {
        self.membership_size / 2 + 1
    }

    /// Move to `term` if it is newer. Clears the vote and the known leader.
    /// Returns `false` and changes nothing otherwise.
    pub fn advance_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        true
    }

    /// Start a new term, as a candidate does. Returns the new term.
    pub fn increment_term(&mut self) -> u64 {
        self.advance_term(self.current_term + 1);
        self.current_term
    }

    /// Record a vote in the current term. Refused if the vote already went
    /// to someone else.
    pub fn vote_for(&mut self, candidate: &str) -> bool {
        match &self.voted_for {
            Some(existing) if existing != candidate => false,
            _ => {
                self.voted_for = Some(candidate.to_string());
                true
            }
        }
    }

    pub fn set_leader(&mut self, leader: Option<NodeId>) {
        self.leader_id = leader;
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        if last_log_term != self.last_log_term {
            last_log_term > self.last_log_term
        } else {
            last_log_index >= self.last_log_index
        }
    }

    /// Record the position of the newest log entry. Older positions are ignored.
    pub fn record_log(&mut self, term: u64, index: u64) {
        if (term, index) > (self.last_log_term, self.last_log_index) {
            self.last_log_term = term;
            self.last_log_index = index;
        }
    }

    /// Record a commit. Clamped to the log; never moves backwards.
    pub fn record_commit(&mut self, term: u64, index: u64) {
        let index = index.min(self.last_log_index);
        if index > self.last_committed_index {
            self.last_committed_term = term.min(self.last_log_term);
            self.last_committed_index = index;
        }
    }

    /// Record an application to the state machine. Clamped to the commit point.
    pub fn record_applied(&mut self, index: u64) {
        let index = index.min(self.last_committed_index);
        if index > self.last_applied_index {
            self.last_applied_index = index;
        }
    }
}
