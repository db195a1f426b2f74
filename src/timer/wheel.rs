use std::collections::VecDeque;

use super::task::TimerTask;

/// Outcome of inserting into the far wheel.
#[derive(Debug)]
pub enum FarInsert<T> {
    Inserted,
    /// The fire time is already behind the far wheel's window; the near
    /// wheel has moved on and the caller should try from the top.
    Retry(TimerTask<T>),
    /// The fire time is beyond the last far bucket.
    Overflow(TimerTask<T>),
}

/// One tier of the hierarchical timer wheel.
///
/// A wheel covers `[start_ms, start_ms + tick_ms * buckets)` on the scheduler
/// clock. The wheel holds no lock of its own: the scheduler guards the near
/// and far tiers together.
#[derive(Debug)]
pub struct TimerWheel<T> {
    tick_ms: u64,
    buckets: Vec<VecDeque<TimerTask<T>>>,
    start_ms: u64,
    current: usize,
}

impl<T> TimerWheel<T> {
    pub fn new(tick_ms: u64, bucket_count: usize, start_ms: u64) -> Self {
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, VecDeque::new);
        Self {
            tick_ms,
            buckets,
            start_ms,
            current: 0,
        }
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Total time covered by the wheel.
    pub fn span_ms(&self) -> u64 {
        self.tick_ms * self.buckets.len() as u64
    }

    pub fn end_ms(&self) -> u64 {
        self.start_ms + self.span_ms()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Near-wheel insertion. Hands the task back if `fire_at_ms` is past the
    /// end of this rotation.
    pub fn insert(&mut self, task: TimerTask<T>) -> Result<(), TimerTask<T>> {
        let fire_at_ms = task.fire_at_ms();
        if fire_at_ms >= self.end_ms() {
            return Err(task);
        }
        // Buckets before `current` have already been drained this rotation.
        let index = (fire_at_ms.saturating_sub(self.start_ms) / self.tick_ms) as usize;
        let index = index.clamp(self.current, self.buckets.len() - 1);
        self.buckets[index].push_back(task);
        Ok(())
    }

    /// Far-wheel insertion. Bucket `current` always starts at `start_ms`, the
    /// others follow it around the ring.
    pub fn insert_far(&mut self, task: TimerTask<T>) -> FarInsert<T> {
        let fire_at_ms = task.fire_at_ms();
        if fire_at_ms >= self.end_ms() {
            return FarInsert::Overflow(task);
        }
        if fire_at_ms < self.start_ms {
            return FarInsert::Retry(task);
        }
        let offset = ((fire_at_ms - self.start_ms) / self.tick_ms) as usize;
        let index = (self.current + offset) % self.buckets.len();
        self.buckets[index].push_back(task);
        FarInsert::Inserted
    }

    /// Drain every bucket whose time has fully elapsed at `now_ms` into `due`.
    ///
    /// Returns `true` when the rotation completed: the wheel has been reset
    /// to bucket zero and `start_ms` has moved forward by one span.
    pub fn advance(&mut self, now_ms: u64, due: &mut Vec<TimerTask<T>>) -> bool {
        let elapsed = (now_ms.saturating_sub(self.start_ms) / self.tick_ms) as usize;
        let elapsed = elapsed.min(self.buckets.len());
        for bucket in &mut self.buckets[self.current.min(elapsed)..elapsed] {
            due.extend(bucket.drain(..));
        }
        if elapsed == self.buckets.len() {
            self.current = 0;
            self.start_ms += self.span_ms();
            true
        } else {
            self.current = self.current.max(elapsed);
            false
        }
    }

    /// Remove and return the far bucket that starts at `start_ms`, moving the
    /// window forward by one tick.
    pub fn take_next(&mut self) -> VecDeque<TimerTask<T>> {
        let bucket = std::mem::take(&mut self.buckets[self.current]);
        self.start_ms += self.tick_ms;
        self.current = (self.current + 1) % self.buckets.len();
        bucket
    }

    /// Time at which the earliest non-empty bucket becomes due, if any bucket
    /// of this rotation still holds tasks.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.buckets[self.current..]
            .iter()
            .position(|bucket| !bucket.is_empty())
            .map(|offset| self.start_ms + (self.current + offset + 1) as u64 * self.tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task_at(fire_at_ms: u64, tag: u32) -> TimerTask<u32> {
        let mut task = TimerTask::once(Duration::ZERO, tag);
        task.set_fire_at_ms(fire_at_ms);
        task
    }

    #[test]
    fn insert_rejects_beyond_span() {
        let mut wheel = TimerWheel::new(10, 4, 100);
        assert_eq!(wheel.span_ms(), 40);
        assert!(wheel.insert(task_at(139, 1)).is_ok());
        assert!(wheel.insert(task_at(140, 2)).is_err());
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn advance_drains_elapsed_buckets_in_order() {
        let mut wheel = TimerWheel::new(10, 4, 0);
        wheel.insert(task_at(5, 1)).unwrap();
        wheel.insert(task_at(7, 2)).unwrap();
        wheel.insert(task_at(25, 3)).unwrap();

        let mut due = Vec::new();
        assert!(!wheel.advance(9, &mut due));
        assert!(due.is_empty());

        assert!(!wheel.advance(10, &mut due));
        let tags: Vec<_> = due.iter().map(|t| t.payload).collect();
        assert_eq!(tags, vec![1, 2]);
        assert_eq!(wheel.current_index(), 1);

        due.clear();
        assert!(!wheel.advance(29, &mut due));
        assert!(due.is_empty());
        assert!(!wheel.advance(30, &mut due));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn full_rotation_resets_and_moves_start() {
        let mut wheel = TimerWheel::new(10, 4, 0);
        wheel.insert(task_at(35, 1)).unwrap();
        let mut due = Vec::new();
        assert!(wheel.advance(45, &mut due));
        assert_eq!(due.len(), 1);
        assert_eq!(wheel.start_ms(), 40);
        assert_eq!(wheel.current_index(), 0);
    }

    #[test]
    fn late_insert_never_lands_in_drained_bucket() {
        let mut wheel = TimerWheel::new(10, 4, 0);
        let mut due = Vec::new();
        wheel.advance(25, &mut due);
        wheel.insert(task_at(3, 9)).unwrap();
        assert_eq!(wheel.next_due_ms(), Some(30));
    }

    #[test]
    fn next_due_points_at_end_of_first_busy_bucket() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new(10, 6, 100);
        assert_eq!(wheel.next_due_ms(), None);
        wheel.insert(task_at(134, 1)).unwrap();
        assert_eq!(wheel.next_due_ms(), Some(140));
    }

    #[test]
    fn far_insert_wraps_around_current() {
        let mut far = TimerWheel::new(40, 3, 40);
        assert!(matches!(far.insert_far(task_at(50, 1)), FarInsert::Inserted));
        let first = far.take_next();
        assert_eq!(first.len(), 1);
        assert_eq!(far.start_ms(), 80);
        assert_eq!(far.current_index(), 1);

        // [80, 200) is now representable, with 160..200 in bucket 0.
        assert!(matches!(far.insert_far(task_at(170, 2)), FarInsert::Inserted));
        assert!(matches!(far.insert_far(task_at(79, 3)), FarInsert::Retry(_)));
        assert!(matches!(far.insert_far(task_at(200, 4)), FarInsert::Overflow(_)));

        far.take_next();
        far.take_next();
        let wrapped = far.take_next();
        assert_eq!(wrapped.iter().map(|t| t.payload).collect::<Vec<_>>(), vec![2]);
    }
}
