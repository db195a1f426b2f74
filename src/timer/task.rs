use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation handle for a scheduled task.
///
/// Cheap to clone and safe to use from any thread. A recurring task keeps
/// the same handle across every rescheduling, so one `cancel` stops the
/// whole series.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

/// A unit of deferred work.
///
/// `payload` is whatever the consumer needs to act on the firing: an event
/// for a state machine, or a closure for [`run_actions`](super::run_actions).
#[derive(Debug)]
pub struct TimerTask<T> {
    handle: TaskHandle,
    delay: Duration,
    period: Option<Duration>,
    fire_at_ms: u64,
    pub payload: T,
}

impl<T> TimerTask<T> {
    /// Fires once, `delay` after it is scheduled.
    pub fn once(delay: Duration, payload: T) -> Self {
        Self {
            handle: TaskHandle::new(),
            delay,
            period: None,
            fire_at_ms: 0,
            payload,
        }
    }

    /// Fires every `period` until its handle is cancelled.
    pub fn recurring(period: Duration, payload: T) -> Self {
        Self {
            period: Some(period),
            ..Self::once(period, payload)
        }
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_recurring(&self) -> bool {
        self.period.is_some()
    }

    /// Absolute fire time on the scheduler clock, resolved by `schedule`.
    pub fn fire_at_ms(&self) -> u64 {
        self.fire_at_ms
    }

    pub(crate) fn set_fire_at_ms(&mut self, fire_at_ms: u64) {
        self.fire_at_ms = fire_at_ms;
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T: Clone> TimerTask<T> {
    /// The next occurrence of a recurring task, sharing this task's handle.
    pub(crate) fn next_occurrence(&self) -> Option<Self> {
        let period = self.period?;
        Some(Self {
            handle: self.handle.clone(),
            delay: period,
            period: Some(period),
            fire_at_ms: 0,
            payload: self.payload.clone(),
        })
    }
}
