//! Hierarchical timer wheel driving every timeout in the node.
//!
//! Two tiers share one lock and one condition variable:
//!
//! - the **near** wheel has `near_buckets` buckets of `tick_ms` each;
//! - the **far** wheel has `far_buckets` buckets, each as wide as the whole
//!   near wheel.
//!
//! Inserting is O(1) whatever the delay. When the near wheel completes a
//! rotation, the next far bucket is cascaded into it at the precise fire
//! time of each task. Due tasks go to a [`TimerReceiver`], which skips
//! cancelled tasks and reschedules recurring ones.
//!
//! Delays longer than the far wheel can represent are rejected with
//! [`CoordError::TimerCapacityExceeded`](crate::error::CoordError): a
//! dropped timeout would break election safety.

pub mod scheduler;
pub mod task;
pub mod wheel;

pub use scheduler::{run_actions, Action, TimerReceiver, TimerScheduler};
pub use task::{TaskHandle, TimerTask};
