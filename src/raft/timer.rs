use rand::Rng;
use std::time::Duration;

use crate::config::NodeConfig;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// The `[min, max]` election timeout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTimeout {
    min_ms: u64,
    max_ms: u64,
}

impl ElectionTimeout {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.election_timeout_min_ms, config.election_timeout_max_ms)
    }

    /// A fresh randomized timeout, so that followers of one leader rarely
    /// time out together.
    pub fn sample(&self) -> Duration {
        random_election_timeout(self.min_ms, self.max_ms)
    }

    /// Used after granting a vote, to give the round time to finish.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }
}
