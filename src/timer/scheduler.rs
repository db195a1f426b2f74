use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use super::task::{TaskHandle, TimerTask};
use super::wheel::{FarInsert, TimerWheel};
use crate::config::TimerConfig;
use crate::error::{CoordError, Result};

/// Closure payload for schedulers whose consumer is [`run_actions`].
pub type Action = Arc<dyn Fn() + Send + Sync>;

/// Near and far tiers, always locked together.
struct Wheels<T> {
    near: TimerWheel<T>,
    far: TimerWheel<T>,
}

impl<T> Wheels<T> {
    /// Returns `true` if the near wheel rotated and the next far bucket was
    /// cascaded into it.
    fn advance(&mut self, now_ms: u64, due: &mut Vec<TimerTask<T>>) -> bool {
        if !self.near.advance(now_ms, due) {
            return false;
        }
        for task in self.far.take_next() {
            // A far bucket spans exactly one near rotation.
            if let Err(task) = self.near.insert(task) {
                tracing::error!(
                    task_id = task.handle().id(),
                    fire_at_ms = task.fire_at_ms(),
                    near_start_ms = self.near.start_ms(),
                    "Cascaded task outside near wheel, firing early"
                );
                due.push(task);
            }
        }
        true
    }
}

struct Inner<T> {
    wheels: Mutex<Wheels<T>>,
    wakeup: Condvar,
    running: AtomicBool,
    epoch: Instant,
    config: TimerConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Inner<T> {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Advance loop. Runs on the dedicated timer thread until shutdown or
    /// until the consumer goes away.
    fn run_wheels(&self, fired: mpsc::UnboundedSender<TimerTask<T>>) {
        let mut due = Vec::new();
        let mut wheels = self.wheels.lock();

        while self.running.load(Ordering::Acquire) {
            if fired.is_closed() {
                tracing::debug!("Timer consumer dropped, stopping timer wheel");
                break;
            }

            let now_ms = self.now_ms();
            let rotated = wheels.advance(now_ms, &mut due);
            for task in due.drain(..) {
                if fired.send(task).is_err() {
                    self.running.store(false, Ordering::Release);
                    return;
                }
            }
            if rotated {
                continue;
            }

            // An empty near wheel still has to wake at the end of its rotation
            // to pull in the next far bucket.
            let wake_at_ms = wheels
                .near
                .next_due_ms()
                .unwrap_or_else(|| wheels.near.end_ms());
            let wait_ms = wake_at_ms.saturating_sub(now_ms);
            if wait_ms > 0 {
                self.wakeup
                    .wait_for(&mut wheels, Duration::from_millis(wait_ms));
            }
        }
    }
}

/// Two-tier hierarchical timer wheel with a dedicated advance thread.
///
/// `schedule` may be called from any thread. Due tasks are delivered, in
/// bucket order, to the [`TimerReceiver`] returned by [`TimerScheduler::start`].
pub struct TimerScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TimerScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> TimerScheduler<T> {
    pub fn start(config: TimerConfig) -> Result<(Self, TimerReceiver<T>)> {
        config.validate()?;

        let near = TimerWheel::new(config.tick_ms, config.near_buckets, 0);
        let far = TimerWheel::new(near.span_ms(), config.far_buckets, near.span_ms());
        let inner = Arc::new(Inner {
            wheels: Mutex::new(Wheels { near, far }),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
            epoch: Instant::now(),
            config,
            thread: Mutex::new(None),
        });

        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let worker = inner.clone();
        let thread = std::thread::Builder::new()
            .name("timer-wheel".to_string())
            .spawn(move || worker.run_wheels(fired_tx))
            .map_err(|e| CoordError::Internal(format!("failed to spawn timer thread: {}", e)))?;
        *inner.thread.lock() = Some(thread);

        tracing::debug!(
            tick_ms = config.tick_ms,
            near_buckets = config.near_buckets,
            far_buckets = config.far_buckets,
            capacity_ms = config.capacity_ms(),
            "Timer wheel started"
        );

        let scheduler = Self { inner };
        let receiver = TimerReceiver {
            fired: fired_rx,
            scheduler: scheduler.clone(),
        };
        Ok((scheduler, receiver))
    }
}

impl<T> TimerScheduler<T> {
    /// Milliseconds since the scheduler started; the clock fire times use.
    pub fn now_ms(&self) -> u64 {
        self.inner.now_ms()
    }

    pub fn config(&self) -> TimerConfig {
        self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Resolve the task's fire time and place it in the near wheel, or the
    /// far wheel if it lies beyond the current near rotation.
    ///
    /// # Errors
    ///
    /// [`CoordError::TimerCapacityExceeded`] if the delay is longer than the
    /// far wheel can hold. The task is not scheduled; callers must treat this
    /// as fatal misconfiguration.
    pub fn schedule(&self, mut task: TimerTask<T>) -> Result<TaskHandle> {
        if !self.is_running() {
            return Err(CoordError::SchedulerStopped);
        }
        if self.inner.config.check_delay(task.delay_ms()).is_err() {
            return Err(self.capacity_exceeded(&task));
        }
        let handle = task.handle().clone();
        let mut wheels = self.inner.wheels.lock();

        loop {
            task.set_fire_at_ms(self.inner.now_ms() + task.delay_ms());
            task = match wheels.near.insert(task) {
                Ok(()) => break,
                Err(task) => task,
            };
            let outcome = wheels.far.insert_far(task);
            match outcome {
                FarInsert::Inserted => break,
                FarInsert::Retry(t) => {
                    // Time moved past the far window between the two
                    // attempts; look at the wheels again.
                    task = t;
                    drop(wheels);
                    std::thread::yield_now();
                    wheels = self.inner.wheels.lock();
                }
                FarInsert::Overflow(t) => return Err(self.capacity_exceeded(&t)),
            }
        }

        drop(wheels);
        self.inner.wakeup.notify_one();
        Ok(handle)
    }

    fn capacity_exceeded(&self, task: &TimerTask<T>) -> CoordError {
        let capacity_ms = self.inner.config.capacity_ms();
        tracing::error!(
            task_id = task.handle().id(),
            delay_ms = task.delay_ms(),
            capacity_ms,
            "Timer delay exceeds wheel capacity"
        );
        CoordError::TimerCapacityExceeded {
            delay_ms: task.delay_ms(),
            capacity_ms,
        }
    }

    pub fn schedule_once(&self, delay: Duration, payload: T) -> Result<TaskHandle> {
        self.schedule(TimerTask::once(delay, payload))
    }

    pub fn schedule_recurring(&self, period: Duration, payload: T) -> Result<TaskHandle> {
        self.schedule(TimerTask::recurring(period, payload))
    }

    /// Number of tasks still held by the wheels.
    pub fn pending(&self) -> usize {
        let wheels = self.inner.wheels.lock();
        wheels.near.len() + wheels.far.len()
    }

    /// Stop the advance thread and wait for it to exit. Tasks still in the
    /// wheels are dropped.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        // Taking the lock orders the store before the thread's next wait.
        drop(self.inner.wheels.lock());
        self.inner.wakeup.notify_all();
        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("Timer wheel thread panicked");
            }
        }
    }
}

/// Consumer side of the scheduler.
///
/// Cancelled tasks are discarded here, even when they were already handed
/// over by the wheel. Recurring tasks are put back on the wheel before being
/// returned.
pub struct TimerReceiver<T> {
    fired: mpsc::UnboundedReceiver<TimerTask<T>>,
    scheduler: TimerScheduler<T>,
}

impl<T: Clone> TimerReceiver<T> {
    pub async fn recv(&mut self) -> Option<TimerTask<T>> {
        loop {
            let task = self.fired.recv().await?;
            if let Some(task) = self.accept(task) {
                return Some(task);
            }
        }
    }

    /// Blocking variant for consumers running on their own thread. Must not
    /// be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<TimerTask<T>> {
        loop {
            let task = self.fired.blocking_recv()?;
            if let Some(task) = self.accept(task) {
                return Some(task);
            }
        }
    }

    fn accept(&self, task: TimerTask<T>) -> Option<TimerTask<T>> {
        if task.is_cancelled() {
            tracing::trace!(task_id = task.handle().id(), "Skipping cancelled timer task");
            return None;
        }
        if let Some(next) = task.next_occurrence() {
            if let Err(e) = self.scheduler.schedule(next) {
                tracing::error!(
                    task_id = task.handle().id(),
                    error = %e,
                    "Failed to reschedule recurring task"
                );
            }
        }
        Some(task)
    }
}

/// Run closure tasks until the scheduler stops. A panicking action is logged
/// and does not stop the loop.
pub fn run_actions(mut receiver: TimerReceiver<Action>) {
    while let Some(task) = receiver.blocking_recv() {
        let action = task.payload.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| action())) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task_id = task.handle().id(), reason = %reason, "Timer action panicked");
        }
    }
}
