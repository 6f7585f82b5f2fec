//! Admission predicates evaluated before every enqueue.

use crate::controller::ControlParameter;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A pluggable gate consulted by a sink before events are enqueued
///
/// `occupancy` is the number of events pending in (or reserved on) the
/// queue; `incoming` is the number of events the caller wants to add.
/// Implementations must not mutate anything on rejection.
pub trait EnqueuePredicate: Send + Sync + fmt::Debug {
    fn accept(&self, occupancy: usize, incoming: usize) -> bool;
}

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl EnqueuePredicate for AcceptAll {
    fn accept(&self, _occupancy: usize, _incoming: usize) -> bool {
        true
    }
}

/// Rejects once the queue holds `threshold` events
///
/// A threshold of zero or less means unlimited.
#[derive(Debug)]
pub struct QueueThresholdPredicate {
    threshold: AtomicI64,
}

impl QueueThresholdPredicate {
    pub fn new(threshold: i64) -> Self {
        Self {
            threshold: AtomicI64::new(threshold),
        }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold.load(Ordering::Acquire)
    }

    pub fn set_threshold(&self, threshold: i64) {
        self.threshold.store(threshold, Ordering::Release);
    }
}

impl EnqueuePredicate for QueueThresholdPredicate {
    fn accept(&self, occupancy: usize, incoming: usize) -> bool {
        let threshold = self.threshold();
        if threshold <= 0 {
            return true;
        }
        (occupancy as u64).saturating_add(incoming as u64) <= threshold as u64
    }
}

impl ControlParameter for QueueThresholdPredicate {
    fn value(&self) -> f64 {
        self.threshold() as f64
    }

    fn set_value(&self, value: f64) {
        self.set_threshold(value.round() as i64);
    }

    fn released_value(&self) -> Option<f64> {
        Some(0.0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting the admitted event rate
///
/// Refills at `rate` events per second up to `depth` tokens. A rate of
/// zero or less disables the limit.
#[derive(Debug)]
pub struct RateLimitingPredicate {
    rate: AtomicCell<f64>,
    depth: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimitingPredicate {
    pub fn new(rate: f64, depth: usize) -> Self {
        let depth = depth.max(1) as f64;
        Self {
            rate: AtomicCell::new(rate),
            depth,
            bucket: Mutex::new(Bucket {
                tokens: depth,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Target rate in events per second
    pub fn rate(&self) -> f64 {
        self.rate.load()
    }

    pub fn set_rate(&self, rate: f64) {
        self.rate.store(rate);
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }
}

impl EnqueuePredicate for RateLimitingPredicate {
    fn accept(&self, _occupancy: usize, incoming: usize) -> bool {
        let rate = self.rate();
        if rate <= 0.0 {
            return true;
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.depth);
        bucket.last_refill = now;

        let wanted = incoming as f64;
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            true
        } else {
            false
        }
    }
}

impl ControlParameter for RateLimitingPredicate {
    fn value(&self) -> f64 {
        self.rate()
    }

    fn set_value(&self, value: f64) {
        self.set_rate(value);
    }

    fn released_value(&self) -> Option<f64> {
        Some(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_predicate() {
        let predicate = QueueThresholdPredicate::new(10);
        assert!(predicate.accept(9, 1));
        assert!(!predicate.accept(10, 1));
        assert!(predicate.accept(5, 5));
        assert!(!predicate.accept(5, 6));
    }

    #[test]
    fn test_threshold_unlimited() {
        let predicate = QueueThresholdPredicate::new(0);
        assert!(predicate.accept(1_000_000, 1));
        predicate.set_threshold(-1);
        assert!(predicate.accept(1_000_000, 1));
    }

    #[test]
    fn test_threshold_as_control_parameter() {
        let predicate = QueueThresholdPredicate::new(4);
        predicate.set_value(7.4);
        assert_eq!(predicate.threshold(), 7);
        assert_eq!(predicate.value(), 7.0);
    }

    #[test]
    fn test_rate_limit_bucket_depth() {
        let predicate = RateLimitingPredicate::new(0.001, 3);
        assert!(predicate.accept(0, 1));
        assert!(predicate.accept(0, 2));
        assert!(!predicate.accept(0, 1));
    }

    #[test]
    fn test_rate_limit_disabled() {
        let predicate = RateLimitingPredicate::new(0.0, 1);
        for _ in 0..100 {
            assert!(predicate.accept(0, 1));
        }
    }

    #[test]
    fn test_rate_limit_refills() {
        let predicate = RateLimitingPredicate::new(1000.0, 1);
        assert!(predicate.accept(0, 1));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(predicate.accept(0, 1));
    }
}
