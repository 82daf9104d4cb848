//! # Slotscout
//!
//! Stealth operation executor for finding and rebooking earlier appointment
//! slots on a booking site.
//!
//! Every invocation runs through a fixed interaction protocol: a risk check,
//! fingerprint masking and a human-looking warm-up, reading the current
//! booking, navigating to the availability calendar and collecting earlier
//! slots. `execute_change` continues through selecting a slot, reviewing and
//! confirming.
//!
//! ## Features
//!
//! - **Masked by Default** - JavaScript evasions installed once per page context
//! - **Human Pacing** - Normally distributed delays, interpolated pointer paths
//! - **Self-throttling** - Risk level derived from session counters gates every run
//! - **Emergency Stop** - Cancels the running invocation at its next wait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slotscout::{BookingSite, CheckConfig, StealthConfig, StealthExecutor};
//!
//! #[tokio::main]
//! async fn main() -> slotscout::Result<()> {
//!     let page = BookingSite::new("1 March 2025", "8:10am")
//!         .offer("2025-02-10", &["09:00", "13:30"])
//!         .build();
//!
//!     let mut executor = StealthExecutor::new(page, StealthConfig::default());
//!     let result = executor.check(&CheckConfig::default()).await;
//!
//!     println!("{}", result.to_json()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use slotscout::StealthConfig;
//!
//! let mut config = StealthConfig::cautious();
//! config.max_candidates = 3;
//! config.masking.canvas_noise = false;
//! assert!(config.validate().is_ok());
//! ```

pub mod booking;
pub mod driver;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod pacer;
pub mod protocol;
pub mod risk;
pub mod session;
pub mod stealth;

use std::path::Path;

use serde::{Deserialize, Serialize};

// Re-exports
pub use booking::{
    BookingStrategy, CandidateSlot, CurrentBooking, DateRange, Extraction, PageSelectors,
};
pub use driver::simulated::{BookingSite, ClickAction};
pub use driver::{
    BoundingBox, ElementHandle, PageDriver, PointerEvent, PointerKind, ReadyState,
    SimulatedElement, SimulatedPage, SimulatedPageBuilder,
};
pub use error::{Error, FailureReason, Result};
pub use executor::StealthExecutor;
pub use monitor::Monitor;
pub use pacer::Pacer;
pub use protocol::{OperationResult, ProtocolRun, ProtocolState};
pub use risk::{Policy, RiskAssessor, RiskConfig, RiskLevel};
pub use session::{Session, SessionMetrics, StopHandle};
pub use stealth::{
    DelayCategory, FingerprintMasker, HardwareProfile, MaskState, MaskingConfig,
    MotionSimulator, TimingConfig, TimingModel,
};

/// Longest configurable polling interval (one week)
const MAX_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Largest risk multiplier on the polling interval
const MAX_RISK_MULTIPLIER: f64 = 100.0;

/// Configuration for the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    /// Delay bands and polling interval curve
    pub timing: TimingConfig,
    /// Risk thresholds
    pub risk: RiskConfig,
    /// Which evasions to install
    pub masking: MaskingConfig,
    /// Page selectors for the booking site
    pub selectors: PageSelectors,
    /// How long a navigation may take before `navigation_timeout`
    pub navigation_timeout_ms: u64,
    /// How long to wait for elements that render after a click
    pub element_timeout_ms: u64,
    /// Polling interval while waiting on the page
    pub poll_interval_ms: u64,
    /// Stop searching once this many candidate slots are found
    pub max_candidates: usize,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            risk: RiskConfig::default(),
            masking: MaskingConfig::default(),
            selectors: PageSelectors::default(),
            navigation_timeout_ms: 30_000,
            element_timeout_ms: 5_000,
            poll_interval_ms: 100,
            max_candidates: 5,
        }
    }
}

impl StealthConfig {
    /// Create a cautious config (slower polling, stricter risk thresholds)
    pub fn cautious() -> Self {
        let defaults = Self::default();
        Self {
            timing: TimingConfig {
                base_interval_ms: defaults.timing.base_interval_ms * 2,
                interval_floor_ms: defaults.timing.interval_floor_ms * 2,
                ..defaults.timing
            },
            risk: RiskConfig {
                high_failure_rate: 0.20,
                high_checks_per_hour: 60.0,
                medium_failure_rate: 0.10,
                medium_checks_per_hour: 30.0,
                medium_throttle_factor: 2.0,
                ..defaults.risk
            },
            max_candidates: 3,
            ..defaults
        }
    }

    /// Create a minimal config (no masking)
    pub fn minimal() -> Self {
        Self {
            masking: MaskingConfig {
                enabled: false,
                canvas_noise: false,
                webgl_spoof: false,
                ..MaskingConfig::default()
            },
            ..Default::default()
        }
    }

    /// Reject values the executor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(Error::Config("max_candidates must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.navigation_timeout_ms < self.poll_interval_ms {
            return Err(Error::Config(
                "navigation_timeout_ms must cover at least one poll".into(),
            ));
        }
        if self.risk.medium_failure_rate > self.risk.high_failure_rate
            || self.risk.medium_checks_per_hour > self.risk.high_checks_per_hour
        {
            return Err(Error::Config(
                "medium risk thresholds must not exceed high thresholds".into(),
            ));
        }
        if self.risk.medium_throttle_factor < 1.0 {
            return Err(Error::Config(
                "medium_throttle_factor must be at least 1.0".into(),
            ));
        }
        let timing = &self.timing;
        if timing.base_interval_ms > MAX_INTERVAL_MS || timing.interval_floor_ms > MAX_INTERVAL_MS {
            return Err(Error::Config(format!(
                "polling intervals must not exceed {MAX_INTERVAL_MS}ms"
            )));
        }
        for (name, value) in [
            ("medium_multiplier", timing.medium_multiplier),
            ("high_multiplier", timing.high_multiplier),
        ] {
            if !(1.0..=MAX_RISK_MULTIPLIER).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} must be between 1 and {MAX_RISK_MULTIPLIER}"
                )));
            }
        }
        Ok(())
    }

    /// Load config from JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-invocation parameters supplied by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Acceptable test centres; empty accepts any
    pub centres: Vec<String>,
    /// Inclusive bounds on candidate dates
    pub date_range: DateRange,
    /// Shorter warm-up and skimming instead of reading
    pub rapid_mode: bool,
}

impl CheckConfig {
    /// Whether a slot at `centre` is acceptable
    pub fn accepts_centre(&self, centre: Option<&str>) -> bool {
        match centre {
            Some(c) if !self.centres.is_empty() => {
                self.centres.iter().any(|want| want.eq_ignore_ascii_case(c))
            }
            _ => true,
        }
    }

    /// Save check config to JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load check config from JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}
