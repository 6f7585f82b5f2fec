//! A staged event-driven runtime.
//!
//! An application is decomposed into stages. Each stage owns a bounded
//! queue of pending events, an event handler and its own elastic thread
//! pool. Producers enqueue through an admission-controlled sink; workers
//! pull batches off the queue and hand them to the handler. An optional
//! response time controller watches each stage's 90th percentile latency
//! and tightens or relaxes admission to keep it near a target.
//!
//! # Features
//!
//! - Bounded queues with close, all-or-nothing batch enqueue and
//!   two-phase (prepare/commit/abort) enqueue
//! - Swappable admission predicates: queue threshold and token bucket
//! - Drain-all and throttled batch sorters
//! - Per-stage thread pools that grow on backlog and shrink when idle
//! - Sliding-window response time percentiles and smoothed service rate
//! - AIMD response time controller with escalation to a secondary controller
//! - Configuration from serde or flat dotted keys
//!
//! # Example
//!
//! ```ignore
//! use stage_runtime::{Runtime, RuntimeConfig, StageBuilder};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let stage = runtime.create_stage(
//!     StageBuilder::new("printer", |events: Vec<String>| {
//!         for event in events {
//!             println!("{event}");
//!         }
//!         Ok(())
//!     })
//!     .queue_threshold(100),
//! )?;
//!
//! stage.sink().enqueue("hello".to_string())?;
//! runtime.shutdown();
//! ```

pub mod admission;
pub mod config;
pub mod controller;
pub mod error;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod sorter;
pub mod stage;
pub mod stats;

// Re-exports for convenience
pub use admission::{AcceptAll, EnqueuePredicate, QueueThresholdPredicate, RateLimitingPredicate};
pub use config::{ResolvedStageConfig, RuntimeConfig, StageConfig, ThreadPoolConfig};
pub use controller::{
    Adjustment, Band, Bands, ControlParameter, ControllerConfig, QualityKnob,
    ResponseTimeController,
};
pub use error::{EnqueueError, QueueError, Result, RuntimeError};
pub use queue::{BoundedQueue, EnqueueTransaction};
pub use runtime::Runtime;
pub use scheduler::{FailurePolicy, PoolState, Scheduler, ThreadPool};
pub use sink::Sink;
pub use sorter::{Batch, BatchSorter, Completion, DrainAllSorter, SorterPolicy, ThrottledSorter};
pub use stage::{EventHandler, HandlerCapability, Stage, StageBuilder, StageContext};
pub use stats::{PercentileTracker, StageStats, StatsSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
