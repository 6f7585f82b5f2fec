//! Producer-facing view of a stage queue with admission control.

use crate::admission::{AcceptAll, EnqueuePredicate};
use crate::error::EnqueueError;
use crate::queue::{BoundedQueue, EnqueueTransaction};
use crate::stats::StageStats;
use parking_lot::RwLock;
use std::sync::Arc;

/// Admission-controlled sink wrapping a stage's queue
///
/// Every enqueue first evaluates the active predicate under the queue
/// lock. The predicate can be swapped at runtime.
#[derive(Debug)]
pub struct Sink<E> {
    queue: BoundedQueue<E>,
    predicate: Arc<RwLock<Arc<dyn EnqueuePredicate>>>,
    stats: StageStats,
}

impl<E> Clone for Sink<E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            predicate: Arc::clone(&self.predicate),
            stats: self.stats.clone(),
        }
    }
}

impl<E> Sink<E> {
    /// Wrap `queue`, recording admission outcomes into `stats`
    pub fn new(queue: BoundedQueue<E>, predicate: Arc<dyn EnqueuePredicate>, stats: StageStats) -> Self {
        Self {
            queue,
            predicate: Arc::new(RwLock::new(predicate)),
            stats,
        }
    }

    /// Wrap `queue` without admission control
    pub fn unguarded(queue: BoundedQueue<E>) -> Self {
        Self::new(queue, Arc::new(AcceptAll), StageStats::new())
    }

    /// The currently active predicate
    pub fn predicate(&self) -> Arc<dyn EnqueuePredicate> {
        Arc::clone(&*self.predicate.read())
    }

    /// Replace the active predicate
    pub fn set_predicate(&self, predicate: Arc<dyn EnqueuePredicate>) {
        *self.predicate.write() = predicate;
    }

    /// The underlying queue
    pub fn queue(&self) -> &BoundedQueue<E> {
        &self.queue
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if no events are pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Hard capacity of the underlying queue
    pub fn capacity(&self) -> Option<usize> {
        self.queue.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Close the underlying queue
    pub fn close(&self) {
        self.queue.close();
    }

    fn record<T, U>(&self, count: usize, result: &Result<T, U>) {
        match result {
            Ok(_) => self.stats.record_admitted(count as u64),
            Err(_) => self.stats.record_rejected(count as u64),
        }
    }

    /// Enqueue one event
    ///
    /// Fails with `Closed`, `AdmissionRejected` or `Full`, handing the
    /// event back.
    pub fn enqueue(&self, event: E) -> Result<(), EnqueueError<E>> {
        let predicate = self.predicate();
        let gate = |occupancy: usize, incoming: usize| predicate.accept(occupancy, incoming);
        let result = self.queue.enqueue_gated(event, Some(&gate));
        self.record(1, &result);
        result
    }

    /// Enqueue one event, dropping it on any failure
    pub fn enqueue_lossy(&self, event: E) -> bool {
        self.enqueue(event).is_ok()
    }

    /// Enqueue all events or none; a rejection refuses the whole batch
    pub fn enqueue_many(&self, events: Vec<E>) -> Result<(), EnqueueError<Vec<E>>> {
        let count = events.len();
        let predicate = self.predicate();
        let gate = |occupancy: usize, incoming: usize| predicate.accept(occupancy, incoming);
        let result = self.queue.enqueue_many_gated(events, Some(&gate));
        self.record(count, &result);
        result
    }

    /// Reserve admission and capacity for `events` without publishing them
    pub fn enqueue_prepare(&self, events: Vec<E>) -> Result<EnqueueTransaction<E>, EnqueueError<Vec<E>>> {
        let count = events.len();
        let predicate = self.predicate();
        let gate = |occupancy: usize, incoming: usize| predicate.accept(occupancy, incoming);
        let result = self.queue.prepare_gated(events, Some(&gate));
        self.record(count, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::QueueThresholdPredicate;
    use crate::error::QueueError;

    fn threshold_sink(threshold: i64) -> (Sink<u32>, Arc<QueueThresholdPredicate>) {
        let predicate = Arc::new(QueueThresholdPredicate::new(threshold));
        let sink = Sink::new(BoundedQueue::unbounded(), predicate.clone(), StageStats::new());
        (sink, predicate)
    }

    #[test]
    fn test_admission_rejected_is_distinct_from_full() {
        let (sink, _) = threshold_sink(1);
        sink.enqueue(1).unwrap();
        let err = sink.enqueue(2).unwrap_err();
        assert_eq!(err.error, QueueError::AdmissionRejected);

        let bounded = Sink::unguarded(BoundedQueue::new(1));
        bounded.enqueue(1).unwrap();
        assert_eq!(bounded.enqueue(2).unwrap_err().error, QueueError::Full);
    }

    #[test]
    fn test_enqueue_many_rejects_whole_batch() {
        let (sink, _) = threshold_sink(3);
        sink.enqueue(0).unwrap();
        let err = sink.enqueue_many(vec![1, 2, 3]).unwrap_err();
        assert_eq!(err.error, QueueError::AdmissionRejected);
        assert_eq!(sink.len(), 1);
        sink.enqueue_many(vec![1, 2]).unwrap();
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_threshold_mutation_takes_effect() {
        let (sink, predicate) = threshold_sink(1);
        sink.enqueue(1).unwrap();
        assert!(!sink.enqueue_lossy(2));
        predicate.set_threshold(2);
        assert!(sink.enqueue_lossy(2));
    }

    #[test]
    fn test_predicate_swap() {
        let (sink, _) = threshold_sink(1);
        sink.enqueue(1).unwrap();
        sink.set_predicate(Arc::new(AcceptAll));
        assert!(sink.enqueue_lossy(2));
        assert_eq!(sink.queue().dequeue_all(), vec![1, 2]);
    }

    #[test]
    fn test_prepare_respects_admission() {
        let (sink, _) = threshold_sink(2);
        let txn = sink.enqueue_prepare(vec![1, 2]).unwrap();
        assert!(!sink.enqueue_lossy(3));
        txn.abort();
        assert!(sink.enqueue_lossy(3));
    }

    #[test]
    fn test_admission_counters() {
        let stats = StageStats::new();
        let sink = Sink::new(
            BoundedQueue::unbounded(),
            Arc::new(QueueThresholdPredicate::new(2)),
            stats.clone(),
        );
        for i in 0..5 {
            let _ = sink.enqueue_lossy(i);
        }
        assert_eq!(stats.total_admitted(), 2);
        assert_eq!(stats.total_rejected(), 3);
    }
}
