//! FIFO mailbox of pending events for one stage.
//!
//! All mutation happens under a single `parking_lot` mutex. Two condition
//! variables wake blocked consumers (`not_empty`) and blocked producers
//! (`not_full`). Dequeue operations always move events into a freshly
//! allocated `Vec`, so no caller ever observes the queue's own storage.

use crate::error::{EnqueueError, QueueError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `now + timeout`, or `None` when the sum overflows (wait without deadline)
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Wait on `condvar` until notified or `deadline` passes; true on timeout
pub(crate) fn wait_until_deadline<T>(
    condvar: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => condvar.wait_until(guard, deadline).timed_out(),
        None => {
            condvar.wait(guard);
            false
        }
    }
}

/// Admission gate evaluated under the queue lock: `(occupancy, incoming) -> accept`
pub(crate) type Gate<'a> = Option<&'a dyn Fn(usize, usize) -> bool>;

#[derive(Debug)]
struct QueueState<E> {
    events: VecDeque<E>,
    /// Slots held by prepared but not yet committed transactions
    reserved: usize,
    closed: bool,
}

#[derive(Debug)]
struct Shared<E> {
    state: Mutex<QueueState<E>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

/// A closeable, optionally bounded FIFO queue
#[derive(Debug)]
pub struct BoundedQueue<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for BoundedQueue<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> BoundedQueue<E> {
    /// Create a queue holding at most `capacity` events
    ///
    /// A capacity of zero is treated as unlimited.
    pub fn new(capacity: usize) -> Self {
        Self::with_capacity(if capacity == 0 { None } else { Some(capacity) })
    }

    /// Create a queue without a capacity limit
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue with an optional capacity limit
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    reserved: 0,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity: capacity.filter(|c| *c > 0),
            }),
        }
    }

    /// Capacity limit, `None` if unlimited
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Number of events visible to consumers
    pub fn len(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    /// Check if no events are pending
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().events.is_empty()
    }

    /// Visible events plus slots reserved by open transactions
    pub fn occupancy(&self) -> usize {
        let state = self.shared.state.lock();
        state.events.len() + state.reserved
    }

    /// Check whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the queue. Blocked producers and consumers wake immediately.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    fn free_slots(&self, state: &QueueState<E>) -> usize {
        match self.shared.capacity {
            Some(cap) => cap.saturating_sub(state.events.len() + state.reserved),
            None => usize::MAX,
        }
    }

    /// Closed, then admission, then capacity.
    fn check(&self, state: &QueueState<E>, count: usize, gate: Gate<'_>) -> Result<(), QueueError> {
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(gate) = gate {
            if !gate(state.events.len() + state.reserved, count) {
                return Err(QueueError::AdmissionRejected);
            }
        }
        if self.free_slots(state) < count {
            return Err(QueueError::Full);
        }
        Ok(())
    }

    fn wake_consumers(&self, count: usize) {
        if count == 1 {
            self.shared.not_empty.notify_one();
        } else if count > 1 {
            self.shared.not_empty.notify_all();
        }
    }

    pub(crate) fn enqueue_gated(&self, event: E, gate: Gate<'_>) -> Result<(), EnqueueError<E>> {
        let mut state = self.shared.state.lock();
        if let Err(err) = self.check(&state, 1, gate) {
            return Err(EnqueueError::new(err, event));
        }
        state.events.push_back(event);
        drop(state);
        self.wake_consumers(1);
        Ok(())
    }

    pub(crate) fn enqueue_many_gated(
        &self,
        events: Vec<E>,
        gate: Gate<'_>,
    ) -> Result<(), EnqueueError<Vec<E>>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(EnqueueError::new(QueueError::Closed, events));
        }
        if events.is_empty() {
            return Ok(());
        }
        let count = events.len();
        if let Err(err) = self.check(&state, count, gate) {
            return Err(EnqueueError::new(err, events));
        }
        state.events.extend(events);
        drop(state);
        self.wake_consumers(count);
        Ok(())
    }

    pub(crate) fn prepare_gated(
        &self,
        events: Vec<E>,
        gate: Gate<'_>,
    ) -> Result<EnqueueTransaction<E>, EnqueueError<Vec<E>>> {
        let mut state = self.shared.state.lock();
        let checked = if events.is_empty() {
            self.check(&state, 0, None)
        } else {
            self.check(&state, events.len(), gate)
        };
        if let Err(err) = checked {
            return Err(EnqueueError::new(err, events));
        }
        state.reserved += events.len();
        Ok(EnqueueTransaction {
            queue: self.clone(),
            events,
            settled: false,
        })
    }

    /// Append an event without blocking
    ///
    /// Fails with `Closed` or `Full`; the event is handed back in the error.
    pub fn enqueue(&self, event: E) -> Result<(), EnqueueError<E>> {
        self.enqueue_gated(event, None)
    }

    /// Append an event, waiting up to `timeout` for capacity
    pub fn enqueue_timeout(&self, event: E, timeout: Duration) -> Result<(), EnqueueError<E>> {
        let deadline = deadline_after(timeout);
        let mut state = self.shared.state.lock();
        loop {
            match self.check(&state, 1, None) {
                Ok(()) => break,
                Err(QueueError::Full) => {
                    if wait_until_deadline(&self.shared.not_full, &mut state, deadline) {
                        let err = self.check(&state, 1, None).err();
                        match err {
                            None => break,
                            Some(err) => return Err(EnqueueError::new(err, event)),
                        }
                    }
                }
                Err(err) => return Err(EnqueueError::new(err, event)),
            }
        }
        state.events.push_back(event);
        drop(state);
        self.wake_consumers(1);
        Ok(())
    }

    /// Append an event if possible, silently dropping it otherwise
    pub fn enqueue_lossy(&self, event: E) -> bool {
        self.enqueue(event).is_ok()
    }

    /// Append every event or none of them
    pub fn enqueue_many(&self, events: Vec<E>) -> Result<(), EnqueueError<Vec<E>>> {
        self.enqueue_many_gated(events, None)
    }

    /// Reserve capacity for `events` without making them visible
    ///
    /// The returned transaction must be committed to publish the events;
    /// aborting or dropping it releases the reservation.
    pub fn enqueue_prepare(&self, events: Vec<E>) -> Result<EnqueueTransaction<E>, EnqueueError<Vec<E>>> {
        self.prepare_gated(events, None)
    }

    fn take(&self, state: &mut MutexGuard<'_, QueueState<E>>, max: usize) -> Vec<E> {
        let n = max.min(state.events.len());
        let batch: Vec<E> = state.events.drain(..n).collect();
        if n > 0 {
            self.shared.not_full.notify_all();
        }
        batch
    }

    /// Remove the head event, if any
    pub fn dequeue(&self) -> Option<E> {
        let mut state = self.shared.state.lock();
        let event = state.events.pop_front();
        if event.is_some() {
            self.shared.not_full.notify_one();
        }
        event
    }

    /// Drain every pending event into a new `Vec`
    pub fn dequeue_all(&self) -> Vec<E> {
        self.dequeue_up_to(usize::MAX)
    }

    /// Drain at most `max` pending events into a new `Vec`
    pub fn dequeue_up_to(&self, max: usize) -> Vec<E> {
        let mut state = self.shared.state.lock();
        self.take(&mut state, max)
    }

    /// Wait up to `timeout` for at least one event, then drain everything
    ///
    /// Returns an empty `Vec` on timeout. Once the queue is closed, events
    /// still pending are handed out; `Closed` is reported when none remain.
    pub fn blocking_dequeue_all(&self, timeout: Duration) -> Result<Vec<E>, QueueError> {
        self.blocking_dequeue_up_to(usize::MAX, timeout)
    }

    /// Wait up to `timeout` for at least one event, then drain at most `max`
    pub fn blocking_dequeue_up_to(&self, max: usize, timeout: Duration) -> Result<Vec<E>, QueueError> {
        let deadline = deadline_after(timeout);
        let mut state = self.shared.state.lock();
        while state.events.is_empty() {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if wait_until_deadline(&self.shared.not_empty, &mut state, deadline) {
                break;
            }
        }
        if state.events.is_empty() && state.closed {
            return Err(QueueError::Closed);
        }
        Ok(self.take(&mut state, max))
    }
}

/// A split-phase enqueue holding reserved capacity
///
/// Dropping an unsettled transaction is equivalent to `abort`.
#[derive(Debug)]
#[must_use = "an uncommitted transaction releases its reservation when dropped"]
pub struct EnqueueTransaction<E> {
    queue: BoundedQueue<E>,
    events: Vec<E>,
    settled: bool,
}

impl<E> EnqueueTransaction<E> {
    /// Number of events covered by the reservation
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the transaction covers no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Publish the reserved events to consumers
    ///
    /// Fails with `Closed` if the queue was closed after the reservation;
    /// the reservation is released and the events are handed back.
    pub fn commit(mut self) -> Result<(), EnqueueError<Vec<E>>> {
        self.settled = true;
        let events = std::mem::take(&mut self.events);
        let count = events.len();
        let mut state = self.queue.shared.state.lock();
        state.reserved -= count;
        if state.closed {
            drop(state);
            self.queue.shared.not_full.notify_all();
            return Err(EnqueueError::new(QueueError::Closed, events));
        }
        state.events.extend(events);
        drop(state);
        self.queue.wake_consumers(count);
        Ok(())
    }

    /// Release the reservation and hand the events back
    pub fn abort(mut self) -> Vec<E> {
        self.release();
        std::mem::take(&mut self.events)
    }

    fn release(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        let mut state = self.queue.shared.state.lock();
        state.reserved -= self.events.len();
        drop(state);
        self.queue.shared.not_full.notify_all();
    }
}

impl<E> Drop for EnqueueTransaction<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_drain() {
        let queue = BoundedQueue::new(10);
        for i in 0..5 {
            queue.enqueue(i).unwrap();
        }
        assert_eq!(queue.dequeue_all(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue() {
        let queue = BoundedQueue::new(2);
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        let err = queue.enqueue(3).unwrap_err();
        assert_eq!(err.error, QueueError::Full);
        assert_eq!(err.into_event(), 3);
        assert!(!queue.enqueue_lossy(4));
        assert_eq!(queue.dequeue_all(), vec![1, 2]);
    }

    #[test]
    fn test_enqueue_many_all_or_nothing() {
        let queue = BoundedQueue::new(4);
        queue.enqueue(0).unwrap();
        let err = queue.enqueue_many(vec![1, 2, 3, 4]).unwrap_err();
        assert_eq!(err.error, QueueError::Full);
        assert_eq!(err.event, vec![1, 2, 3, 4]);
        assert_eq!(queue.len(), 1);

        queue.enqueue_many(vec![1, 2, 3]).unwrap();
        assert_eq!(queue.dequeue_all(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_prepare_abort_is_noop() {
        let queue = BoundedQueue::new(3);
        queue.enqueue(1).unwrap();
        let txn = queue.enqueue_prepare(vec![2, 3]).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.occupancy(), 3);
        assert!(!queue.enqueue_lossy(9));

        assert_eq!(txn.abort(), vec![2, 3]);
        assert_eq!(queue.occupancy(), 1);
        assert_eq!(queue.dequeue_all(), vec![1]);
    }

    #[test]
    fn test_prepare_commit_publishes() {
        let queue = BoundedQueue::new(3);
        let txn = queue.enqueue_prepare(vec![1, 2]).unwrap();
        assert!(queue.dequeue_all().is_empty());
        txn.commit().unwrap();
        assert_eq!(queue.dequeue_all(), vec![1, 2]);
        assert_eq!(queue.occupancy(), 0);
    }

    #[test]
    fn test_dropped_transaction_releases() {
        let queue = BoundedQueue::new(2);
        {
            let _txn = queue.enqueue_prepare(vec![1, 2]).unwrap();
            assert_eq!(queue.occupancy(), 2);
        }
        assert_eq!(queue.occupancy(), 0);
        queue.enqueue_many(vec![3, 4]).unwrap();
    }

    #[test]
    fn test_commit_after_close() {
        let queue = BoundedQueue::new(2);
        let txn = queue.enqueue_prepare(vec![1]).unwrap();
        queue.close();
        let err = txn.commit().unwrap_err();
        assert_eq!(err.error, QueueError::Closed);
        assert_eq!(queue.occupancy(), 0);
    }

    #[test]
    fn test_closed_rejects_enqueue() {
        let queue = BoundedQueue::unbounded();
        queue.close();
        assert_eq!(queue.enqueue(1).unwrap_err().error, QueueError::Closed);
        assert!(!queue.enqueue_lossy(2));
        assert_eq!(
            queue.blocking_dequeue_all(Duration::from_millis(10)),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn test_close_drains_pending_first() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue(1).unwrap();
        queue.close();
        assert_eq!(queue.blocking_dequeue_all(Duration::ZERO), Ok(vec![1]));
        assert_eq!(
            queue.blocking_dequeue_all(Duration::ZERO),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue: BoundedQueue<u32> = BoundedQueue::unbounded();
        let consumer = queue.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || consumer.blocking_dequeue_all(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(handle.join().unwrap(), Err(QueueError::Closed));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = BoundedQueue::new(1);
        queue.enqueue(0u32).unwrap();
        let producer = queue.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            producer
                .enqueue_timeout(1, Duration::from_secs(10))
                .map_err(|err| err.error)
        });
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(handle.join().unwrap(), Err(QueueError::Closed));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_unbounded_wait_duration() {
        let queue = BoundedQueue::new(4);
        queue.enqueue_timeout(1u32, Duration::MAX).unwrap();
        assert_eq!(queue.blocking_dequeue_up_to(1, Duration::MAX), Ok(vec![1]));

        let consumer = queue.clone();
        let handle = thread::spawn(move || consumer.blocking_dequeue_all(Duration::MAX));
        thread::sleep(Duration::from_millis(20));
        queue.enqueue(2).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(vec![2]));
    }

    #[test]
    fn test_empty_enqueue_on_closed_queue() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        assert!(queue.enqueue_many(Vec::new()).is_ok());
        queue.close();
        assert_eq!(
            queue.enqueue_many(Vec::new()).unwrap_err().error,
            QueueError::Closed
        );
        assert_eq!(
            queue.enqueue_prepare(Vec::new()).unwrap_err().error,
            QueueError::Closed
        );
    }

    #[test]
    fn test_blocking_dequeue_timeout() {
        let queue: BoundedQueue<u32> = BoundedQueue::unbounded();
        let batch = queue.blocking_dequeue_all(Duration::from_millis(10)).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_dequeue_up_to_leaves_rest() {
        let queue = BoundedQueue::unbounded();
        queue.enqueue_many((0..10).collect()).unwrap();
        assert_eq!(queue.dequeue_up_to(4), vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 6);
        assert_eq!(queue.dequeue(), Some(4));
    }

    #[test]
    fn test_enqueue_timeout_waits_for_space() {
        let queue = BoundedQueue::new(1);
        queue.enqueue(1).unwrap();
        let err = queue
            .enqueue_timeout(2, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.error, QueueError::Full);

        let consumer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            consumer.dequeue()
        });
        queue.enqueue_timeout(3, Duration::from_secs(5)).unwrap();
        assert_eq!(handle.join().unwrap(), Some(1));
        assert_eq!(queue.dequeue_all(), vec![3]);
    }

    #[test]
    fn test_capacity() {
        let queue: BoundedQueue<i32> = BoundedQueue::new(42);
        assert_eq!(queue.capacity(), Some(42));
        assert_eq!(BoundedQueue::<i32>::new(0).capacity(), None);
    }
}
