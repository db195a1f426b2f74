//! Messages exchanged between cluster nodes.
//!
//! Only the fields are defined here. Framing and byte encoding belong to the
//! network layer, which can use the serde derives and [`Message::api_id`].

use serde::{Deserialize, Serialize};

use crate::config::NodeId;

/// API identifiers shared by a request kind and its response.
pub const API_HEARTBEAT: i16 = 0;
pub const API_VOTE: i16 = 1;
pub const API_LEADER_HEARTBEAT: i16 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Connection-level keep-alive; the first one identifies the sender.
    Heartbeat { node_id: NodeId },
    /// Candidate asking for a vote. The candidate is the identified sender.
    Vote {
        term: u64,
        last_log_term: u64,
        last_log_index: u64,
    },
    /// Leader asserting its leadership for `term`.
    LeaderHeartbeat { term: u64, node_id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Heartbeat,
    /// `term` is the responder's current term after handling the request.
    Vote { term: u64, granted: bool },
    LeaderHeartbeat { term: u64, accepted: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn api_id(&self) -> i16 {
        match self {
            Request::Heartbeat { .. } => API_HEARTBEAT,
            Request::Vote { .. } => API_VOTE,
            Request::LeaderHeartbeat { .. } => API_LEADER_HEARTBEAT,
        }
    }
}

impl Response {
    pub fn api_id(&self) -> i16 {
        match self {
            Response::Heartbeat => API_HEARTBEAT,
            Response::Vote { .. } => API_VOTE,
            Response::LeaderHeartbeat { .. } => API_LEADER_HEARTBEAT,
        }
    }
}

impl Message {
    pub fn api_id(&self) -> i16 {
        match self {
            Message::Request(req) => req.api_id(),
            Message::Response(resp) => resp.api_id(),
        }
    }

    pub fn api_name(&self) -> &'static str {
        match self.api_id() {
            API_HEARTBEAT => "heartbeat",
            API_VOTE => "vote",
            API_LEADER_HEARTBEAT => "leader heartbeat",
            _ => "unknown",
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}
