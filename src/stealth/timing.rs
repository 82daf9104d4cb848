//! Human-shaped timing
//!
//! Delays are drawn from a normal distribution centred in each category's
//! band and clamped to it, so pacing varies like a person's while the worst
//! case stays bounded.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::time::Duration;

use crate::risk::RiskLevel;

// Thread-local RNG
thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::thread_rng());
}

/// Uniform integer in `[min, max)`; returns `min` for an empty range
pub(crate) fn random_range(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    RNG.with(|rng| rng.borrow_mut().gen_range(min..max))
}

/// Uniform float in `[min, max)`; returns `min` for an empty range
pub(crate) fn random_f64_range(min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    RNG.with(|rng| rng.borrow_mut().gen_range(min..max))
}

pub(crate) fn random_bool(probability: f64) -> bool {
    RNG.with(|rng| rng.borrow_mut().gen_bool(probability.clamp(0.0, 1.0)))
}

/// Uniform in `[0, 1)`
fn unit() -> f64 {
    RNG.with(|rng| rng.borrow_mut().gen::<f64>())
}

/// Delay category, each with a fixed millisecond band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayCategory {
    /// Routine clicks and moves
    Simple,
    /// Looking over page content
    Reading,
    /// Choosing between options
    Decision,
    /// Right before an irreversible action
    Important,
}

impl DelayCategory {
    /// `(min, max)` in milliseconds
    pub fn band_ms(&self) -> (u64, u64) {
        match self {
            DelayCategory::Simple => (800, 2000),
            DelayCategory::Reading => (1500, 3500),
            DelayCategory::Decision => (2000, 4500),
            DelayCategory::Important => (3000, 7000),
        }
    }
}

/// Box-Muller normal sample from two uniforms, clamped to `[min, max]`.
///
/// `u1` must be in `(0, 1]`; `u2` in `[0, 1)`.
pub fn clamped_normal(min: f64, max: f64, u1: f64, u2: f64) -> f64 {
    let mean = (min + max) / 2.0;
    let std_dev = (max - min) / 6.0;
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    (mean + z * std_dev).clamp(min, max)
}

/// Adaptive polling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Base interval between checks at low risk and full success, in ms
    pub base_interval_ms: u64,
    /// The interval never goes below this, in ms
    pub interval_floor_ms: u64,
    /// Multiplier applied at medium risk
    pub medium_multiplier: f64,
    /// Multiplier applied at high risk
    pub high_multiplier: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 5 * 60 * 1000,
            interval_floor_ms: 60 * 1000,
            medium_multiplier: 2.0,
            high_multiplier: 4.0,
        }
    }
}

/// Produces human-shaped delays and the adaptive polling interval
#[derive(Debug, Clone, Default)]
pub struct TimingModel {
    config: TimingConfig,
}

impl TimingModel {
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Sample a delay for the category
    pub fn delay(&self, category: DelayCategory) -> Duration {
        let (min, max) = category.band_ms();
        // 1 - [0,1) keeps u1 away from zero so ln() stays finite
        let ms = clamped_normal(min as f64, max as f64, 1.0 - unit(), unit());
        Duration::from_micros((ms * 1000.0).round() as u64)
    }

    /// Sample a delay and widen it by a throttle factor (values below 1 are ignored)
    pub fn delay_scaled(&self, category: DelayCategory, factor: f64) -> Duration {
        self.delay(category).mul_f64(factor.max(1.0))
    }

    /// Uniform micro-pause in `[min_ms, max_ms]`
    pub fn micro(&self, min_ms: u64, max_ms: u64) -> Duration {
        Duration::from_millis(random_range(min_ms, max_ms + 1))
    }

    /// Interval before the next check.
    ///
    /// Grows with risk and as the success rate falls; strictly ordered by
    /// risk for equal success rates and never below the configured floor.
    pub fn adaptive_interval(&self, success_rate: f64, risk: RiskLevel) -> Duration {
        let base = self
            .config
            .base_interval_ms
            .max(self.config.interval_floor_ms)
            .max(1) as f64;
        let medium = self.config.medium_multiplier.max(1.25);
        let risk_multiplier = match risk {
            RiskLevel::Low => 1.0,
            RiskLevel::Medium => medium,
            RiskLevel::High => self.config.high_multiplier.max(medium * 1.25),
        };
        let success = if success_rate.is_nan() {
            0.0
        } else {
            success_rate.clamp(0.0, 1.0)
        };
        let success_multiplier = 2.0 - success;
        // Saturate rather than panic on configs too large for a Duration
        Duration::try_from_secs_f64(base * risk_multiplier * success_multiplier / 1000.0)
            .unwrap_or(Duration::MAX)
    }
}
