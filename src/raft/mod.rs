//! Leader election.
//!
//! Only terms, votes and leadership are handled here. Log replication is
//! out of scope; log positions are carried so that vote decisions can
//! compare them.

pub mod node;
pub mod state;
pub mod timer;

pub use node::RaftNode;
pub use state::{MembershipState, RaftProperties, RaftRole};
pub use timer::ElectionTimeout;
