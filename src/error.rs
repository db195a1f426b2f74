use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    /// The delay cannot be represented by the configured wheel dimensions.
    /// Raised instead of dropping the timeout.
    #[error("Timer delay of {delay_ms}ms exceeds wheel capacity of {capacity_ms}ms")]
    TimerCapacityExceeded { delay_ms: u64, capacity_ms: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timer scheduler is stopped")]
    SchedulerStopped,

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Whether the node must stop rather than keep running with a lost timeout.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordError::TimerCapacityExceeded { .. } | CoordError::SchedulerStopped
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
