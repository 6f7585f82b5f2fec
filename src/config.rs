//! Configuration surface consumed by the runtime.
//!
//! Options can be set globally or per stage; per-stage values win. The
//! structs deserialize from any serde format, and `RuntimeConfig::from_pairs`
//! accepts the flat dotted-key form (`global.threadPool.maxThreads`,
//! `stages.<name>.rtController.targetResponseTime`, ...).

use crate::controller::ControllerConfig;
use crate::error::{Result, RuntimeError};
use crate::sorter::SorterPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_millis(1000);
pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_SMOOTHING: f64 = 0.5;
pub const DEFAULT_RECALCULATION_WINDOW: u64 = 200;
pub const DEFAULT_MIN_THRESHOLD: f64 = 1.0;
pub const DEFAULT_MAX_THRESHOLD: f64 = 1024.0;

/// Options for one stage, or global defaults. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageConfig {
    pub initial_threads: Option<usize>,
    pub min_threads: Option<usize>,
    pub max_threads: Option<usize>,
    pub block_time_millis: Option<u64>,
    pub idle_time_threshold_millis: Option<u64>,
    /// Queue backlog above which the pool adds a worker
    pub grow_backlog: Option<usize>,
    pub termination_timeout_millis: Option<u64>,
    pub queue_threshold: Option<i64>,
    pub queue_capacity: Option<usize>,
    /// Only honored in the global section
    pub crash_on_exception: Option<bool>,
    pub target_response_time_millis: Option<f64>,
    pub smoothing_constant: Option<f64>,
    pub recalculation_window: Option<u64>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub batch_aggregation_cap: Option<usize>,
}

impl StageConfig {
    /// Fields set in `self` override those in `base`
    pub fn merged_over(&self, base: &StageConfig) -> StageConfig {
        StageConfig {
            initial_threads: self.initial_threads.or(base.initial_threads),
            min_threads: self.min_threads.or(base.min_threads),
            max_threads: self.max_threads.or(base.max_threads),
            block_time_millis: self.block_time_millis.or(base.block_time_millis),
            idle_time_threshold_millis: self
                .idle_time_threshold_millis
                .or(base.idle_time_threshold_millis),
            grow_backlog: self.grow_backlog.or(base.grow_backlog),
            termination_timeout_millis: self
                .termination_timeout_millis
                .or(base.termination_timeout_millis),
            queue_threshold: self.queue_threshold.or(base.queue_threshold),
            queue_capacity: self.queue_capacity.or(base.queue_capacity),
            crash_on_exception: self.crash_on_exception.or(base.crash_on_exception),
            target_response_time_millis: self
                .target_response_time_millis
                .or(base.target_response_time_millis),
            smoothing_constant: self.smoothing_constant.or(base.smoothing_constant),
            recalculation_window: self.recalculation_window.or(base.recalculation_window),
            min_threshold: self.min_threshold.or(base.min_threshold),
            max_threshold: self.max_threshold.or(base.max_threshold),
            batch_aggregation_cap: self.batch_aggregation_cap.or(base.batch_aggregation_cap),
        }
    }

    fn set(&mut self, option: &str, value: &str) -> Result<bool> {
        match option {
            "initialThreads" => self.initial_threads = Some(parse(option, value)?),
            "minThreads" => self.min_threads = Some(parse(option, value)?),
            "maxThreads" => {
                // Zero or negative means unbounded
                let max: i64 = parse(option, value)?;
                self.max_threads = if max <= 0 { None } else { Some(max as usize) };
            }
            "blockTime" | "blockTimeMillis" => self.block_time_millis = Some(parse(option, value)?),
            "idleTimeThreshold" | "idleTimeThresholdMillis" => {
                self.idle_time_threshold_millis = Some(parse(option, value)?)
            }
            "growBacklog" | "queueBacklog" => self.grow_backlog = Some(parse(option, value)?),
            "terminationTimeout" | "terminationTimeoutMillis" => {
                self.termination_timeout_millis = Some(parse(option, value)?)
            }
            "queueThreshold" => self.queue_threshold = Some(parse(option, value)?),
            "queueCapacity" => self.queue_capacity = Some(parse(option, value)?),
            "crashOnException" => self.crash_on_exception = Some(parse(option, value)?),
            "targetResponseTime" | "targetResponseTimeMillis" => {
                self.target_response_time_millis = Some(parse(option, value)?)
            }
            "smoothConst" | "smoothingConstant" => {
                self.smoothing_constant = Some(parse(option, value)?)
            }
            "recalculationWindow" => self.recalculation_window = Some(parse(option, value)?),
            "minThreshold" => self.min_threshold = Some(parse(option, value)?),
            "maxThreshold" => self.max_threshold = Some(parse(option, value)?),
            "batchAggregationCap" | "maxAggregation" => {
                self.batch_aggregation_cap = Some(parse(option, value)?)
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn parse<T: FromStr>(option: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RuntimeError::Config(format!("invalid value {value:?} for {option}")))
}

/// Elastic thread pool settings for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    pub initial_threads: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Longest a worker waits for a batch before re-checking its state
    pub block_time: Duration,
    /// Idle time after which a worker above `min_threads` retires
    pub idle_timeout: Duration,
    pub grow_backlog: Option<usize>,
    /// Grace period for in-flight batches on shutdown
    pub termination_timeout: Duration,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            initial_threads: 1,
            min_threads: 1,
            max_threads: usize::MAX,
            block_time: DEFAULT_BLOCK_TIME,
            idle_timeout: DEFAULT_BLOCK_TIME,
            grow_backlog: None,
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
        }
    }
}

impl ThreadPoolConfig {
    /// A fixed-size pool of `threads` workers
    pub fn fixed(threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            initial_threads: threads,
            min_threads: threads,
            max_threads: threads,
            ..Self::default()
        }
    }

    /// Enforce `1 <= min <= initial <= max`
    pub fn normalized(mut self) -> Self {
        self.min_threads = self.min_threads.max(1);
        self.max_threads = self.max_threads.max(self.min_threads);
        self.initial_threads = self
            .initial_threads
            .clamp(self.min_threads, self.max_threads);
        self
    }

    /// Pin the pool to exactly one worker
    pub fn single_threaded(mut self) -> Self {
        self.initial_threads = 1;
        self.min_threads = 1;
        self.max_threads = 1;
        self.grow_backlog = None;
        self
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }
}

/// Fully resolved settings for one stage
#[derive(Debug, Clone)]
pub struct ResolvedStageConfig {
    pub pool: ThreadPoolConfig,
    pub queue_threshold: Option<i64>,
    pub queue_capacity: Option<usize>,
    pub controller: Option<ControllerConfig>,
    pub sorter: SorterPolicy,
}

impl Default for ResolvedStageConfig {
    fn default() -> Self {
        StageConfig::default().into()
    }
}

impl From<StageConfig> for ResolvedStageConfig {
    fn from(cfg: StageConfig) -> Self {
        let block_time = cfg
            .block_time_millis
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BLOCK_TIME);
        let pool = ThreadPoolConfig {
            initial_threads: cfg.initial_threads.unwrap_or(1),
            min_threads: cfg.min_threads.unwrap_or(1),
            max_threads: cfg.max_threads.filter(|m| *m > 0).unwrap_or(usize::MAX),
            block_time,
            idle_timeout: cfg
                .idle_time_threshold_millis
                .map(Duration::from_millis)
                .unwrap_or(block_time),
            grow_backlog: cfg.grow_backlog.filter(|b| *b > 0),
            termination_timeout: cfg
                .termination_timeout_millis
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TERMINATION_TIMEOUT),
        }
        .normalized();

        let controller = cfg
            .target_response_time_millis
            .filter(|t| *t > 0.0)
            .map(|target| {
                let target = Duration::from_micros((target * 1000.0).round() as u64);
                let mut ctl = ControllerConfig::queue_threshold(target);
                ctl.smoothing = cfg.smoothing_constant.unwrap_or(DEFAULT_SMOOTHING);
                ctl.recalculation_window = cfg
                    .recalculation_window
                    .unwrap_or(DEFAULT_RECALCULATION_WINDOW);
                ctl.min_value = cfg.min_threshold.unwrap_or(DEFAULT_MIN_THRESHOLD);
                ctl.max_value = cfg.max_threshold.unwrap_or(DEFAULT_MAX_THRESHOLD);
                ctl.initial_value = Some(ctl.min_value);
                ctl
            });

        let sorter = match cfg.batch_aggregation_cap.filter(|cap| *cap > 0) {
            Some(max_batch) => SorterPolicy::Throttled {
                max_batch,
                max_outstanding: None,
            },
            None => SorterPolicy::DrainAll,
        };

        ResolvedStageConfig {
            pool,
            queue_threshold: cfg.queue_threshold.filter(|t| *t > 0),
            queue_capacity: cfg.queue_capacity.filter(|c| *c > 0),
            controller,
            sorter,
        }
    }
}

/// Global defaults plus per-stage overrides
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub global: StageConfig,
    pub stages: HashMap<String, StageConfig>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from flat dotted key/value settings
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Apply one dotted key. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let (section, rest) = match parts.as_slice() {
            ["global", rest @ ..] => (&mut self.global, rest),
            ["stages", name, rest @ ..] => (
                self.stages.entry((*name).to_string()).or_default(),
                rest,
            ),
            _ => {
                debug!(key, "Ignoring unrecognized configuration key");
                return Ok(());
            }
        };
        let option = rest
            .iter()
            .copied()
            .filter(|part| {
                !matches!(
                    *part,
                    "threadPool" | "sizeController" | "rtController" | "batchSorter"
                )
            })
            .last();
        let applied = match option {
            Some(option) => section.set(option, value)?,
            None => false,
        };
        if !applied {
            debug!(key, "Ignoring unrecognized configuration key");
        }
        Ok(())
    }

    /// Whether a handler failure terminates the process
    pub fn crash_on_exception(&self) -> bool {
        self.global.crash_on_exception.unwrap_or(false)
    }

    /// Per-stage options over global options over built-in defaults
    pub fn resolve(&self, stage: &str) -> ResolvedStageConfig {
        let merged = match self.stages.get(stage) {
            Some(own) => own.merged_over(&self.global),
            None => self.global.clone(),
        };
        merged.into()
    }
}
