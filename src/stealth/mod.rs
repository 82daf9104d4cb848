//! Stealth Layer
//!
//! All the anti-detection components:
//! - JavaScript evasion scripts and the masker that installs them
//! - Per-session hardware profile
//! - Human-shaped timing
//! - Synthetic pointer motion

pub mod evasions;
pub mod fingerprint;
pub mod masker;
pub mod motion;
pub mod timing;

pub use evasions::{build_evasion_script, MaskingConfig};
pub use fingerprint::{HardwareProfile, Platform};
pub use masker::{FingerprintMasker, MaskState};
pub use motion::MotionSimulator;
pub use timing::{DelayCategory, TimingConfig, TimingModel};
