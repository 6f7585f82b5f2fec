use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of batch samples kept for percentile estimation
pub const RESPONSE_TIME_WINDOW: usize = 1000;

/// Weight of the previous estimate when smoothing the service rate
pub const SERVICE_RATE_SMOOTHING: f64 = 0.7;

/// A percentile tracker that maintains a sliding window of measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Nearest-rank percentile, `p` in `[0, 1]`. Zero when empty.
    pub fn percentile(&self, p: f64) -> Duration {
        let mut sorted: Vec<u64> = {
            let measurements = self.measurements.lock();
            if measurements.is_empty() {
                return Duration::ZERO;
            }
            measurements.iter().copied().collect()
        };
        sorted.sort_unstable();

        let p = p.clamp(0.0, 1.0);
        let idx = ((sorted.len() as f64 * p).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        Duration::from_nanos(sorted[idx])
    }

    /// Get the count of recorded measurements
    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Running measurements for one stage
///
/// Updated by every worker after each batch; cheap to clone and share.
#[derive(Debug, Clone)]
pub struct StageStats {
    events_processed: Arc<AtomicU64>,
    batches: Arc<AtomicU64>,
    handler_failures: Arc<AtomicU64>,
    admitted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    /// Smoothed events per second; last writer wins between concurrent batches
    service_rate: Arc<AtomicCell<f64>>,
    response_times: PercentileTracker,
    start_time: Instant,
}

impl StageStats {
    pub fn new() -> Self {
        Self::with_window(RESPONSE_TIME_WINDOW)
    }

    /// Stats keeping the last `window` batch response times
    pub fn with_window(window: usize) -> Self {
        Self {
            events_processed: Arc::new(AtomicU64::new(0)),
            batches: Arc::new(AtomicU64::new(0)),
            handler_failures: Arc::new(AtomicU64::new(0)),
            admitted: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            service_rate: Arc::new(AtomicCell::new(0.0)),
            response_times: PercentileTracker::new(window),
            start_time: Instant::now(),
        }
    }

    /// Record one executed batch of `event_count` events taking `elapsed`
    pub fn record_service_rate(&self, event_count: usize, elapsed: Duration) {
        self.events_processed
            .fetch_add(event_count as u64, Ordering::Relaxed);
        let batches = self.batches.fetch_add(1, Ordering::Relaxed);
        self.response_times.record(elapsed.as_nanos() as u64);

        let secs = elapsed.max(Duration::from_micros(1)).as_secs_f64();
        let sample = event_count as f64 / secs;
        let next = if batches == 0 {
            sample
        } else {
            SERVICE_RATE_SMOOTHING * self.service_rate.load()
                + (1.0 - SERVICE_RATE_SMOOTHING) * sample
        };
        self.service_rate.store(next);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self, count: u64) {
        self.admitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, count: u64) {
        self.rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn total_batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn total_handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn total_admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Smoothed service rate in events per second
    pub fn service_rate(&self) -> f64 {
        self.service_rate.load()
    }

    /// Overall throughput since creation in events per second
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    /// Response time at percentile `p` over the sample window
    pub fn response_time_percentile(&self, p: f64) -> Duration {
        self.response_times.percentile(p)
    }

    /// 90th percentile batch response time; the controller's input signal
    pub fn ninetieth_response_time(&self) -> Duration {
        self.response_time_percentile(0.90)
    }

    /// Number of response time samples currently in the window
    pub fn sample_count(&self) -> usize {
        self.response_times.count()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_processed: self.total_processed(),
            total_batches: self.total_batches(),
            total_handler_failures: self.total_handler_failures(),
            total_admitted: self.total_admitted(),
            total_rejected: self.total_rejected(),
            service_rate: self.service_rate(),
            response_p50: self.response_time_percentile(0.50),
            response_p90: self.ninetieth_response_time(),
            response_p99: self.response_time_percentile(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of stage stats at a point in time
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub total_batches: u64,
    pub total_handler_failures: u64,
    pub total_admitted: u64,
    pub total_rejected: u64,
    pub service_rate: f64,
    pub response_p50: Duration,
    pub response_p90: Duration,
    pub response_p99: Duration,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Format stats as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Processed: {} in {} batches, Failures: {}, Admitted: {}, Rejected: {}, \
             Service rate: {:.2} ev/s, RT P50: {:.2}ms, P90: {:.2}ms, P99: {:.2}ms, Elapsed: {:.2}s",
            self.total_processed,
            self.total_batches,
            self.total_handler_failures,
            self.total_admitted,
            self.total_rejected,
            self.service_rate,
            self.response_p50.as_secs_f64() * 1000.0,
            self.response_p90.as_secs_f64() * 1000.0,
            self.response_p99.as_secs_f64() * 1000.0,
            self.elapsed.as_secs_f64()
        )
    }
}
