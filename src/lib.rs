pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod network;
pub mod node;
pub mod raft;
pub mod shard;
pub mod shutdown;
pub mod timer;

pub use error::{CoordError, Result};
