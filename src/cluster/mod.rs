//! Cluster membership at the connection level: who is connected, and the
//! heartbeat protocol that decides it.

pub mod liveness;
pub mod registry;

pub use liveness::LivenessProtocol;
pub use registry::{Identified, NodeRegistry};
