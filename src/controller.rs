//! Response time controller.
//!
//! Every `recalculation_window` observed batches the controller reads the
//! stage's 90th percentile response time, smooths it, classifies the ratio
//! to the target into a band and moves an admission-affecting parameter:
//!
//! | band       | ratio to target          | action                    |
//! |------------|--------------------------|---------------------------|
//! | very low   | `< very_low`             | multiply by `factor`      |
//! | low        | `< low`                  | add `additive_increase`   |
//! | neutral    | `low ..= high`           | hold                      |
//! | high       | `> high`                 | divide by `factor`        |
//! | very high  | `> very_high`            | divide by `factor`        |
//!
//! The result is always clamped into `[min_value, max_value]`.
//!
//! A controller may own a secondary controller (typically a harsher
//! restriction such as a queue threshold). It is enabled immediately in the
//! very high band, or after `escalation_windows` consecutive high windows
//! spent at `min_value`, and disabled again once the ratio drops below
//! `medium`. While enabled it is fed the same observations as its owner.
//! A disabled controller releases its parameter and reapplies its starting
//! value when enabled again.

use crate::stats::StageStats;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A value the controller can read and adjust
pub trait ControlParameter: Send + Sync + fmt::Debug {
    fn value(&self) -> f64;
    fn set_value(&self, value: f64);

    /// Value that imposes no restriction; `None` falls back to the
    /// controller's `max_value`
    fn released_value(&self) -> Option<f64> {
        None
    }
}

/// A free-standing knob, e.g. a load-shedding quality factor read by a handler
#[derive(Debug)]
pub struct QualityKnob {
    value: AtomicCell<f64>,
}

impl QualityKnob {
    pub fn new(value: f64) -> Self {
        Self {
            value: AtomicCell::new(value),
        }
    }

    pub fn get(&self) -> f64 {
        self.value.load()
    }
}

impl ControlParameter for QualityKnob {
    fn value(&self) -> f64 {
        self.value.load()
    }

    fn set_value(&self, value: f64) {
        self.value.store(value);
    }
}

/// Band boundaries as multiples of the target response time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub very_low: f64,
    pub medium: f64,
    pub low: f64,
    pub high: f64,
    pub very_high: f64,
}

impl Bands {
    /// Symmetric ±10% dead zone without the outer bands
    pub fn narrow() -> Self {
        Self {
            very_low: 0.0,
            medium: 0.0,
            low: 0.9,
            high: 1.1,
            very_high: f64::INFINITY,
        }
    }

    /// Five-band layout used for load-shedding quality control
    pub fn graded() -> Self {
        Self {
            very_low: 0.0001,
            medium: 0.5,
            low: 0.8,
            high: 1.1,
            very_high: 1.5,
        }
    }

    pub fn classify(&self, ratio: f64) -> Band {
        if ratio < self.very_low {
            Band::VeryLow
        } else if ratio < self.low {
            Band::Low
        } else if ratio <= self.high {
            Band::Neutral
        } else if ratio > self.very_high {
            Band::VeryHigh
        } else {
            Band::High
        }
    }
}

/// Classification of the smoothed response time relative to target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    VeryLow,
    Low,
    Neutral,
    High,
    VeryHigh,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub target: Duration,
    /// Weight of the previous smoothed value, in `[0, 1)`
    pub smoothing: f64,
    /// Observed batches between recalculations
    pub recalculation_window: u64,
    pub min_value: f64,
    pub max_value: f64,
    /// Starting parameter value; `None` keeps the parameter's current value
    pub initial_value: Option<f64>,
    pub bands: Bands,
    pub additive_increase: f64,
    /// Divisor applied when over target, multiplier when far under it
    pub factor: f64,
    /// Consecutive high windows at minimum before the secondary controller engages
    pub escalation_windows: u32,
}

impl ControllerConfig {
    /// Queue threshold control: start at the minimum, +2 under target, halve over it
    pub fn queue_threshold(target: Duration) -> Self {
        Self {
            target,
            smoothing: 0.5,
            recalculation_window: 200,
            min_value: 1.0,
            max_value: 1024.0,
            initial_value: Some(1.0),
            bands: Bands::narrow(),
            additive_increase: 2.0,
            factor: 2.0,
            escalation_windows: u32::MAX,
        }
    }

    /// Quality control in `[0.01, 1.0]` starting at full quality
    pub fn quality(target: Duration) -> Self {
        Self {
            target,
            smoothing: 0.5,
            recalculation_window: 100,
            min_value: 0.01,
            max_value: 1.0,
            initial_value: Some(1.0),
            bands: Bands::graded(),
            additive_increase: 0.01,
            factor: 2.0,
            escalation_windows: 10,
        }
    }

    fn normalized(mut self) -> Self {
        self.smoothing = self.smoothing.clamp(0.0, 0.999);
        self.recalculation_window = self.recalculation_window.max(1);
        if self.max_value < self.min_value {
            self.max_value = self.min_value;
        }
        if self.factor.is_nan() || self.factor <= 1.0 {
            self.factor = 2.0;
        }
        self.additive_increase = self.additive_increase.max(0.0);
        self
    }
}

/// Outcome of one recalculation
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub band: Band,
    pub smoothed: Duration,
    pub previous: f64,
    pub value: f64,
    /// `Some(enabled)` if the secondary controller was toggled
    pub secondary: Option<bool>,
}

#[derive(Debug, Default)]
struct ControlState {
    smoothed_ms: Option<f64>,
    high_windows_at_min: u32,
}

/// Feedback loop driving a `ControlParameter` toward a response time target
#[derive(Debug)]
pub struct ResponseTimeController {
    config: ControllerConfig,
    parameter: Arc<dyn ControlParameter>,
    start: f64,
    enabled: AtomicBool,
    observations: AtomicU64,
    state: Mutex<ControlState>,
    secondary: Option<Arc<ResponseTimeController>>,
}

impl ResponseTimeController {
    pub fn new(config: ControllerConfig, parameter: Arc<dyn ControlParameter>) -> Self {
        let config = config.normalized();
        let start = config
            .initial_value
            .unwrap_or_else(|| parameter.value())
            .clamp(config.min_value, config.max_value);
        parameter.set_value(start);
        Self {
            config,
            parameter,
            start,
            enabled: AtomicBool::new(true),
            observations: AtomicU64::new(0),
            state: Mutex::new(ControlState::default()),
            secondary: None,
        }
    }

    /// Attach a secondary controller; it starts disabled and released
    pub fn with_secondary(mut self, secondary: Arc<ResponseTimeController>) -> Self {
        secondary.disable();
        self.secondary = Some(secondary);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn target(&self) -> Duration {
        self.config.target
    }

    /// Resume control from the starting value
    pub fn enable(&self) {
        let mut state = self.state.lock();
        if !self.is_enabled() {
            state.high_windows_at_min = 0;
            self.parameter.set_value(self.start);
            self.enabled.store(true, Ordering::Release);
            info!(
                target_ms = self.target_ms(),
                value = self.start,
                "Response time controller enabled"
            );
        }
    }

    /// Stop control and lift the restriction the parameter imposes
    pub fn disable(&self) {
        let _state = self.state.lock();
        let was_enabled = self.enabled.swap(false, Ordering::AcqRel);
        let released = self
            .parameter
            .released_value()
            .unwrap_or(self.config.max_value);
        self.parameter.set_value(released);
        if was_enabled {
            info!(
                target_ms = self.target_ms(),
                value = released,
                "Response time controller disabled"
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Current value of the controlled parameter
    pub fn value(&self) -> f64 {
        self.parameter.value()
    }

    pub fn secondary(&self) -> Option<&Arc<ResponseTimeController>> {
        self.secondary.as_ref()
    }

    /// Current smoothed response time, if any recalculation happened
    pub fn smoothed_response_time(&self) -> Option<Duration> {
        self.state
            .lock()
            .smoothed_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    fn target_ms(&self) -> f64 {
        self.config.target.as_secs_f64() * 1000.0
    }

    /// Count one executed batch; recalculates once per window
    ///
    /// Safe to call from every worker: exactly one caller wins each window.
    /// An enabled secondary controller observes the same batch afterwards.
    pub fn observe(&self, stats: &StageStats) -> Option<Adjustment> {
        if !self.is_enabled() {
            return None;
        }
        let adjustment = self.observe_window(stats);
        if let Some(secondary) = &self.secondary {
            if let Some(adj) = secondary.observe(stats) {
                debug!(value = adj.value, band = ?adj.band, "Secondary controller adjusted");
            }
        }
        adjustment
    }

    fn observe_window(&self, stats: &StageStats) -> Option<Adjustment> {
        let seen = self.observations.fetch_add(1, Ordering::AcqRel) + 1;
        if seen % self.config.recalculation_window != 0 {
            return None;
        }
        if stats.sample_count() == 0 {
            return None;
        }
        let mut state = self.state.lock();
        // Disabled between the check above and taking the lock
        if !self.is_enabled() {
            return None;
        }
        Some(self.adjust(&mut state, stats.ninetieth_response_time()))
    }

    /// Fold `observed` into the smoothed response time and adjust the parameter
    pub fn recalculate(&self, observed: Duration) -> Adjustment {
        let mut state = self.state.lock();
        self.adjust(&mut state, observed)
    }

    fn adjust(&self, state: &mut ControlState, observed: Duration) -> Adjustment {
        let sample = observed.as_secs_f64() * 1000.0;
        let smoothed = match state.smoothed_ms {
            Some(prev) => self.config.smoothing * prev + (1.0 - self.config.smoothing) * sample,
            None => sample,
        };
        state.smoothed_ms = Some(smoothed);

        let target = self.target_ms();
        let ratio = if target > 0.0 {
            smoothed / target
        } else if smoothed > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let band = self.config.bands.classify(ratio);

        let previous = self.parameter.value();
        let proposed = match band {
            Band::VeryLow => previous * self.config.factor,
            Band::Low => previous + self.config.additive_increase,
            Band::Neutral => previous,
            Band::High | Band::VeryHigh => previous / self.config.factor,
        };
        let value = proposed.clamp(self.config.min_value, self.config.max_value);
        if value != previous {
            self.parameter.set_value(value);
        }

        let secondary = match band {
            Band::VeryHigh => {
                state.high_windows_at_min = 0;
                self.toggle_secondary(true)
            }
            Band::High if value <= self.config.min_value => {
                state.high_windows_at_min = state.high_windows_at_min.saturating_add(1);
                if state.high_windows_at_min >= self.config.escalation_windows {
                    self.toggle_secondary(true)
                } else {
                    None
                }
            }
            _ => {
                state.high_windows_at_min = 0;
                if ratio < self.config.bands.medium {
                    self.toggle_secondary(false)
                } else {
                    None
                }
            }
        };

        debug!(
            target_ms = target,
            current_ms = smoothed,
            ?band,
            previous,
            value,
            "Response time recalculated"
        );

        Adjustment {
            band,
            smoothed: Duration::from_secs_f64(smoothed / 1000.0),
            previous,
            value: self.parameter.value(),
            secondary,
        }
    }

    fn toggle_secondary(&self, enable: bool) -> Option<bool> {
        let secondary = self.secondary.as_ref()?;
        if secondary.is_enabled() == enable {
            return None;
        }
        if enable {
            secondary.enable();
        } else {
            secondary.disable();
        }
        Some(enable)
    }
}
