use crate::admission::{AcceptAll, EnqueuePredicate, QueueThresholdPredicate};
use crate::config::{ResolvedStageConfig, ThreadPoolConfig};
use crate::controller::{ControllerConfig, ResponseTimeController};
use crate::error::Result;
use crate::queue::BoundedQueue;
use crate::sink::Sink;
use crate::sorter::{BatchSorter, SorterPolicy};
use crate::stats::StageStats;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Application logic run by a stage's workers
pub trait EventHandler<E>: Send + Sync + 'static {
    /// Called once when the stage is created, before any batch is delivered
    fn init(&self, _ctx: &StageContext<E>) -> Result<()> {
        Ok(())
    }

    /// Handle one batch of events
    ///
    /// An error (or a panic) consumes the batch; it is not redelivered.
    fn handle_events(&self, events: Vec<E>) -> Result<()>;

    /// Called once when the stage is destroyed
    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(Vec<E>) -> Result<()> + Send + Sync + 'static,
{
    fn handle_events(&self, events: Vec<E>) -> Result<()> {
        self(events)
    }
}

/// Whether a handler tolerates concurrent invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerCapability {
    #[default]
    Concurrent,
    /// Batches are delivered strictly one at a time
    SingleThreaded,
}

/// What a handler sees of its own stage
pub struct StageContext<E> {
    name: String,
    sink: Sink<E>,
    stats: StageStats,
}

impl<E> StageContext<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage's own sink, e.g. for re-enqueueing deferred work
    pub fn sink(&self) -> &Sink<E> {
        &self.sink
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }
}

impl<E> Clone for StageContext<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<E> fmt::Debug for StageContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("name", &self.name)
            .field("pending", &self.sink.len())
            .finish()
    }
}

/// A named queue, its handler and everything the scheduler needs to drive it
pub struct Stage<E> {
    name: String,
    sink: Sink<E>,
    handler: Arc<dyn EventHandler<E>>,
    capability: HandlerCapability,
    sorter: Arc<dyn BatchSorter<E>>,
    stats: StageStats,
    controller: Option<Arc<ResponseTimeController>>,
    pool: ThreadPoolConfig,
}

impl<E> Stage<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer-facing entry point of this stage
    pub fn sink(&self) -> &Sink<E> {
        &self.sink
    }

    pub fn queue(&self) -> &BoundedQueue<E> {
        self.sink.queue()
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler<E>> {
        &self.handler
    }

    pub fn capability(&self) -> HandlerCapability {
        self.capability
    }

    pub fn is_single_threaded(&self) -> bool {
        self.capability == HandlerCapability::SingleThreaded
    }

    pub fn sorter(&self) -> &Arc<dyn BatchSorter<E>> {
        &self.sorter
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub fn controller(&self) -> Option<&Arc<ResponseTimeController>> {
        self.controller.as_ref()
    }

    pub fn pool_config(&self) -> &ThreadPoolConfig {
        &self.pool
    }

    pub fn context(&self) -> StageContext<E> {
        StageContext {
            name: self.name.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<E> fmt::Debug for Stage<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("pending", &self.sink.len())
            .field("controlled", &self.controller.is_some())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Builder for a stage
///
/// Anything left unset falls back to the resolved configuration passed
/// to `build`.
pub struct StageBuilder<E> {
    name: String,
    handler: Arc<dyn EventHandler<E>>,
    capability: HandlerCapability,
    queue_capacity: Option<usize>,
    queue_threshold: Option<i64>,
    predicate: Option<Arc<dyn EnqueuePredicate>>,
    sorter: Option<SorterPolicy>,
    controller: Option<ControllerConfig>,
    custom_controller: Option<Arc<ResponseTimeController>>,
    pool: Option<ThreadPoolConfig>,
}

impl<E: Send + 'static> StageBuilder<E> {
    pub fn new(name: impl Into<String>, handler: impl EventHandler<E>) -> Self {
        Self::with_handler(name, Arc::new(handler))
    }

    /// Start from a shared handler
    pub fn with_handler(name: impl Into<String>, handler: Arc<dyn EventHandler<E>>) -> Self {
        Self {
            name: name.into(),
            handler,
            capability: HandlerCapability::Concurrent,
            queue_capacity: None,
            queue_threshold: None,
            predicate: None,
            sorter: None,
            controller: None,
            custom_controller: None,
            pool: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver batches one at a time; pins the pool to a single worker
    pub fn single_threaded(mut self) -> Self {
        self.capability = HandlerCapability::SingleThreaded;
        self
    }

    pub fn capability(mut self, capability: HandlerCapability) -> Self {
        self.capability = capability;
        self
    }

    /// Hard queue capacity; zero means unlimited
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Admit events only while the queue holds fewer than `threshold`
    pub fn queue_threshold(mut self, threshold: i64) -> Self {
        self.queue_threshold = Some(threshold);
        self
    }

    /// Use a custom admission predicate
    pub fn predicate(mut self, predicate: Arc<dyn EnqueuePredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sorter(mut self, policy: SorterPolicy) -> Self {
        self.sorter = Some(policy);
        self
    }

    /// Drive the stage's queue threshold from its response time
    pub fn response_time_controller(mut self, config: ControllerConfig) -> Self {
        self.controller = Some(config);
        self
    }

    /// Attach a controller over a parameter of the caller's choosing
    pub fn controller(mut self, controller: Arc<ResponseTimeController>) -> Self {
        self.custom_controller = Some(controller);
        self
    }

    pub fn thread_pool(mut self, pool: ThreadPoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Fixed number of workers
    pub fn threads(self, threads: usize) -> Self {
        self.thread_pool(ThreadPoolConfig::fixed(threads))
    }

    /// Assemble the stage over a fresh queue
    pub fn build(self, defaults: &ResolvedStageConfig) -> Stage<E> {
        let capacity = self.queue_capacity.or(defaults.queue_capacity);
        let queue = BoundedQueue::with_capacity(capacity.filter(|c| *c > 0));
        let stats = StageStats::new();
        let threshold = self.queue_threshold.or(defaults.queue_threshold);
        let controller_config = self.controller.or_else(|| defaults.controller.clone());

        let (predicate, controller): (Arc<dyn EnqueuePredicate>, _) =
            match (self.predicate, self.custom_controller, controller_config) {
                (Some(predicate), custom, config) => {
                    if custom.is_none() && config.is_some() {
                        warn!(
                            stage = %self.name,
                            "Custom predicate set; response time controller not attached"
                        );
                    }
                    (predicate, custom)
                }
                (None, Some(custom), _) => (threshold_predicate(threshold), Some(custom)),
                (None, None, Some(config)) => {
                    let threshold = Arc::new(QueueThresholdPredicate::new(threshold.unwrap_or(0)));
                    let controller = ResponseTimeController::new(config, threshold.clone());
                    let predicate: Arc<dyn EnqueuePredicate> = threshold;
                    (predicate, Some(Arc::new(controller)))
                }
                (None, None, None) => (threshold_predicate(threshold), None),
            };

        let mut pool = self.pool.unwrap_or_else(|| defaults.pool.clone());
        if self.capability == HandlerCapability::SingleThreaded {
            pool = pool.single_threaded();
        }

        let sorter = self.sorter.unwrap_or(defaults.sorter).build(queue.clone());

        Stage {
            name: self.name,
            sink: Sink::new(queue, predicate, stats.clone()),
            handler: self.handler,
            capability: self.capability,
            sorter,
            stats,
            controller,
            pool: pool.normalized(),
        }
    }
}

fn threshold_predicate(threshold: Option<i64>) -> Arc<dyn EnqueuePredicate> {
    match threshold {
        Some(threshold) if threshold > 0 => Arc::new(QueueThresholdPredicate::new(threshold)),
        _ => Arc::new(AcceptAll),
    }
}

impl<E> fmt::Debug for StageBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageBuilder")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_threshold", &self.queue_threshold)
            .field("sorter", &self.sorter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::controller::QualityKnob;
    use crate::error::{QueueError, RuntimeError};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn noop(_: Vec<u32>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_closure_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |events: Vec<u32>| -> Result<()> {
            sink.lock().extend(events);
            Ok(())
        };
        handler.handle_events(vec![1, 2]).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_struct_handler_lifecycle() {
        #[derive(Default)]
        struct Recorder {
            name: Mutex<Option<String>>,
        }

        impl EventHandler<u32> for Recorder {
            fn init(&self, ctx: &StageContext<u32>) -> Result<()> {
                *self.name.lock() = Some(ctx.name().to_string());
                Ok(())
            }

            fn handle_events(&self, _events: Vec<u32>) -> Result<()> {
                Err(RuntimeError::handler("boom"))
            }
        }

        let stage = StageBuilder::new("recorder", Recorder::default())
            .build(&ResolvedStageConfig::default());
        stage.handler().init(&stage.context()).unwrap();
        assert!(stage.handler().handle_events(vec![1]).is_err());
        assert!(stage.handler().destroy().is_ok());
    }

    #[test]
    fn test_defaults() {
        let stage = StageBuilder::new("plain", noop).build(&ResolvedStageConfig::default());
        assert_eq!(stage.name(), "plain");
        assert_eq!(stage.capability(), HandlerCapability::Concurrent);
        assert_eq!(stage.queue().capacity(), None);
        assert!(stage.controller().is_none());
        for i in 0..100 {
            stage.sink().enqueue(i).unwrap();
        }
    }

    #[test]
    fn test_single_threaded_pins_pool() {
        let stage = StageBuilder::new("serial", noop)
            .threads(8)
            .single_threaded()
            .build(&ResolvedStageConfig::default());
        let pool = stage.pool_config();
        assert!(stage.is_single_threaded());
        assert_eq!((pool.min_threads, pool.initial_threads, pool.max_threads), (1, 1, 1));
    }

    #[test]
    fn test_queue_threshold_from_config() {
        let config = RuntimeConfig::from_pairs([("stages.limited.queueThreshold", "2")]).unwrap();
        let stage = StageBuilder::new("limited", noop).build(&config.resolve("limited"));
        stage.sink().enqueue(1).unwrap();
        stage.sink().enqueue(2).unwrap();
        assert_eq!(
            stage.sink().enqueue(3).unwrap_err().error,
            QueueError::AdmissionRejected
        );
    }

    #[test]
    fn test_builder_overrides_config() {
        let config = RuntimeConfig::from_pairs([
            ("stages.s.queueThreshold", "2"),
            ("stages.s.queueCapacity", "5"),
        ])
        .unwrap();
        let stage = StageBuilder::new("s", noop)
            .queue_threshold(4)
            .queue_capacity(10)
            .build(&config.resolve("s"));
        assert_eq!(stage.queue().capacity(), Some(10));
        for i in 0..4 {
            stage.sink().enqueue(i).unwrap();
        }
        assert!(!stage.sink().enqueue_lossy(4));
    }

    #[test]
    fn test_controller_drives_threshold() {
        let config = ControllerConfig::queue_threshold(Duration::from_millis(100));
        let stage = StageBuilder::new("controlled", noop)
            .response_time_controller(config)
            .build(&ResolvedStageConfig::default());
        let controller = stage.controller().unwrap();
        assert_eq!(controller.value(), 1.0);

        // Threshold starts at the minimum
        stage.sink().enqueue(1).unwrap();
        assert!(!stage.sink().enqueue_lossy(2));

        controller.recalculate(Duration::from_millis(1));
        assert_eq!(controller.value(), 3.0);
        assert!(stage.sink().enqueue_lossy(2));
    }

    #[test]
    fn test_controller_from_config() {
        let config =
            RuntimeConfig::from_pairs([("stages.c.rtController.targetResponseTime", "50")]).unwrap();
        let stage = StageBuilder::new("c", noop).build(&config.resolve("c"));
        assert_eq!(stage.controller().unwrap().target(), Duration::from_millis(50));
    }

    #[test]
    fn test_custom_controller() {
        let knob = Arc::new(QualityKnob::new(1.0));
        let controller = Arc::new(ResponseTimeController::new(
            ControllerConfig::quality(Duration::from_millis(10)),
            knob.clone(),
        ));
        let stage = StageBuilder::new("degrading", noop)
            .controller(controller)
            .build(&ResolvedStageConfig::default());
        stage.controller().unwrap().recalculate(Duration::from_millis(100));
        assert_eq!(knob.get(), 0.5);
    }

    #[test]
    fn test_context_shares_sink_and_stats() {
        let stage = StageBuilder::new("ctx", noop).build(&ResolvedStageConfig::default());
        let ctx = stage.context();
        ctx.sink().enqueue(7).unwrap();
        assert_eq!(stage.queue().len(), 1);
        assert_eq!(stage.stats().total_admitted(), 1);
    }
}
