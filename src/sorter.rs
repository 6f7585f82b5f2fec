//! Batch sorters pull coherent batches out of a stage queue.
//!
//! Every batch owns a freshly allocated `Vec`, so a handler iterating one
//! batch can never observe a producer or the next fetch touching it.

use crate::error::QueueError;
use crate::queue::{deadline_after, wait_until_deadline, BoundedQueue};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Completion callback of a batch
///
/// Runs exactly once: on `done()`, or when dropped.
pub struct Completion {
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl Completion {
    fn none() -> Self {
        Self { callback: None }
    }

    fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Signal that the batch has been handled
    pub fn done(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// A batch handed to one worker
#[derive(Debug)]
pub struct Batch<E> {
    events: Vec<E>,
    completion: Completion,
}

impl<E> Batch<E> {
    pub fn new(events: Vec<E>) -> Self {
        Self {
            events,
            completion: Completion::none(),
        }
    }

    pub fn with_completion(events: Vec<E>, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            completion: Completion::new(callback),
        }
    }

    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Separate the events from the completion callback
    pub fn into_parts(self) -> (Vec<E>, Completion) {
        (self.events, self.completion)
    }

    /// Discard the events and signal completion
    pub fn batch_done(self) {
        self.completion.done();
    }
}

/// Pulls the next batch of pending events for a stage
pub trait BatchSorter<E>: Send + Sync {
    /// Called once when the stage is registered with a scheduler
    fn init(&self, _stage: &str, _max_threads: usize) {}

    /// Wait up to `timeout` for pending events and return them as a batch
    ///
    /// `Ok(None)` on timeout; `Err(Closed)` once the queue is closed and drained.
    fn next_batch(&self, timeout: Duration) -> Result<Option<Batch<E>>, QueueError>;
}

/// Take everything pending in one batch
#[derive(Debug)]
pub struct DrainAllSorter<E> {
    queue: BoundedQueue<E>,
}

impl<E> DrainAllSorter<E> {
    pub fn new(queue: BoundedQueue<E>) -> Self {
        Self { queue }
    }
}

impl<E: Send> BatchSorter<E> for DrainAllSorter<E> {
    fn next_batch(&self, timeout: Duration) -> Result<Option<Batch<E>>, QueueError> {
        let events = self.queue.blocking_dequeue_all(timeout)?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(Batch::new(events)))
    }
}

#[derive(Debug, Default)]
struct Slots {
    used: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn release(&self) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(1);
        drop(used);
        self.freed.notify_one();
    }
}

/// Cap each batch at `max_batch` events and the number of batches in
/// flight at `max_outstanding`
///
/// Events beyond the cap stay queued for the next fetch. A slot is held
/// from fetch until the batch's completion fires.
#[derive(Debug)]
pub struct ThrottledSorter<E> {
    queue: BoundedQueue<E>,
    max_batch: usize,
    /// Zero means unlimited
    max_outstanding: AtomicUsize,
    slots: Arc<Slots>,
}

impl<E> ThrottledSorter<E> {
    /// `max_outstanding` of `None` defaults to the pool's maximum thread count
    pub fn new(queue: BoundedQueue<E>, max_batch: usize, max_outstanding: Option<usize>) -> Self {
        Self {
            queue,
            max_batch: max_batch.max(1),
            max_outstanding: AtomicUsize::new(max_outstanding.unwrap_or(0)),
            slots: Arc::new(Slots::default()),
        }
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Batches fetched but not yet completed
    pub fn outstanding(&self) -> usize {
        *self.slots.used.lock()
    }

    fn acquire_slot(&self, deadline: Option<Instant>) -> bool {
        let max = self.max_outstanding.load(Ordering::Acquire);
        let mut used = self.slots.used.lock();
        while max != 0 && *used >= max {
            if wait_until_deadline(&self.slots.freed, &mut used, deadline) && *used >= max {
                return false;
            }
        }
        *used += 1;
        true
    }
}

impl<E: Send> BatchSorter<E> for ThrottledSorter<E> {
    fn init(&self, stage: &str, max_threads: usize) {
        if self.max_outstanding.load(Ordering::Acquire) == 0 && max_threads != usize::MAX {
            self.max_outstanding.store(max_threads, Ordering::Release);
        }
        debug!(
            stage = %stage,
            max_batch = self.max_batch,
            max_outstanding = self.max_outstanding.load(Ordering::Acquire),
            "Throttled sorter initialized"
        );
    }

    fn next_batch(&self, timeout: Duration) -> Result<Option<Batch<E>>, QueueError> {
        let deadline = deadline_after(timeout);
        if !self.acquire_slot(deadline) {
            return Ok(None);
        }
        let remaining = deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::MAX);
        match self.queue.blocking_dequeue_up_to(self.max_batch, remaining) {
            Ok(events) if events.is_empty() => {
                self.slots.release();
                Ok(None)
            }
            Ok(events) => {
                let slots = Arc::clone(&self.slots);
                Ok(Some(Batch::with_completion(events, move || slots.release())))
            }
            Err(err) => {
                self.slots.release();
                Err(err)
            }
        }
    }
}

/// Batch sorter selection for a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SorterPolicy {
    /// Drain everything pending per fetch
    #[default]
    DrainAll,
    /// Cap batch size and in-flight batches
    Throttled {
        max_batch: usize,
        max_outstanding: Option<usize>,
    },
}

impl SorterPolicy {
    pub fn build<E: Send + 'static>(self, queue: BoundedQueue<E>) -> Arc<dyn BatchSorter<E>> {
        match self {
            SorterPolicy::DrainAll => Arc::new(DrainAllSorter::new(queue)),
            SorterPolicy::Throttled {
                max_batch,
                max_outstanding,
            } => Arc::new(ThrottledSorter::new(queue, max_batch, max_outstanding)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_drain_all_takes_everything() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many((0..50).collect()).unwrap();
        let sorter = DrainAllSorter::new(queue.clone());
        let batch = sorter.next_batch(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(batch.len(), 50);
        assert_eq!(batch.events()[0], 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_timeout_returns_none() {
        let sorter = DrainAllSorter::<u8>::new(BoundedQueue::unbounded());
        assert!(sorter.next_batch(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_closed_queue_reports_closed() {
        let queue = BoundedQueue::<u8>::unbounded();
        queue.close();
        let sorter = DrainAllSorter::new(queue);
        assert_eq!(
            sorter.next_batch(Duration::from_millis(5)).unwrap_err(),
            QueueError::Closed
        );
    }

    #[test]
    fn test_batch_is_not_aliased() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many(vec![1, 2]).unwrap();
        let sorter = DrainAllSorter::new(queue.clone());
        let batch = sorter.next_batch(Duration::ZERO).unwrap().unwrap();
        queue.enqueue(3).unwrap();
        assert_eq!(batch.events(), &[1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_throttled_caps_batch() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many((0..25).collect()).unwrap();
        let sorter = ThrottledSorter::new(queue.clone(), 10, None);
        let sizes: Vec<usize> = (0..3)
            .map(|_| {
                let batch = sorter.next_batch(Duration::ZERO).unwrap().unwrap();
                let len = batch.len();
                batch.batch_done();
                len
            })
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_throttled_waits_without_deadline() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many(vec![1, 2]).unwrap();
        let sorter = Arc::new(ThrottledSorter::new(queue, 1, Some(1)));
        let first = sorter.next_batch(Duration::MAX).unwrap().unwrap();

        let waiting = Arc::clone(&sorter);
        let handle = std::thread::spawn(move || {
            waiting
                .next_batch(Duration::MAX)
                .map(|batch| batch.map(|b| b.events().to_vec()))
        });
        std::thread::sleep(Duration::from_millis(20));
        first.batch_done();
        assert_eq!(handle.join().unwrap(), Ok(Some(vec![2])));
    }

    #[test]
    fn test_throttled_slots_released_on_done() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many((0..4).collect()).unwrap();
        let sorter = ThrottledSorter::new(queue, 1, Some(1));

        let first = sorter.next_batch(Duration::ZERO).unwrap().unwrap();
        assert_eq!(sorter.outstanding(), 1);
        assert!(sorter.next_batch(Duration::from_millis(10)).unwrap().is_none());

        first.batch_done();
        assert_eq!(sorter.outstanding(), 0);
        let second = sorter.next_batch(Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.events(), &[1]);
        drop(second);
        assert_eq!(sorter.outstanding(), 0);
    }

    #[test]
    fn test_init_defaults_slots_to_pool_size() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many((0..4).collect()).unwrap();
        let sorter = ThrottledSorter::new(queue, 1, None);
        sorter.init("stage", 2);
        let _a = sorter.next_batch(Duration::ZERO).unwrap().unwrap();
        let _b = sorter.next_batch(Duration::ZERO).unwrap().unwrap();
        assert!(sorter.next_batch(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_completion_runs_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let batch = Batch::with_completion(vec![1u8], move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        let (events, completion) = batch.into_parts();
        assert_eq!(events, vec![1]);
        completion.done();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_policy_build() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many((0..5).collect::<Vec<u32>>()).unwrap();
        let sorter = SorterPolicy::Throttled {
            max_batch: 2,
            max_outstanding: None,
        }
        .build(queue);
        assert_eq!(sorter.next_batch(Duration::ZERO).unwrap().unwrap().len(), 2);
    }
}
