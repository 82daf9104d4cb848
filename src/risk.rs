//! Detection risk scoring
//!
//! Risk is recomputed from the session counters at every decision point and
//! mapped to an action policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::SessionMetrics;

/// Coarse likelihood that the session gets flagged as non-human
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// What the executor may do at a given risk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// New operations may start
    pub allow: bool,
    /// Multiplier applied to every category delay
    pub throttle_factor: f64,
}

impl Policy {
    /// Policy that refuses everything
    pub fn blocked() -> Self {
        Self {
            allow: false,
            throttle_factor: 1.0,
        }
    }
}

/// Thresholds of the risk decision table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Failure rate above which risk is high
    pub high_failure_rate: f64,
    /// Checks per hour above which risk is high
    pub high_checks_per_hour: f64,
    /// Failure rate above which risk is medium
    pub medium_failure_rate: f64,
    /// Checks per hour above which risk is medium
    pub medium_checks_per_hour: f64,
    /// Delay multiplier at medium risk
    pub medium_throttle_factor: f64,
    /// Shortest window the check rate is measured over, in seconds
    pub min_rate_window_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            high_failure_rate: 0.30,
            high_checks_per_hour: 120.0,
            medium_failure_rate: 0.15,
            medium_checks_per_hour: 60.0,
            medium_throttle_factor: 1.5,
            min_rate_window_secs: 15 * 60,
        }
    }
}

/// Aggregates session counters into a risk level and policy
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor {
    config: RiskConfig,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// `failures / max(1, checks)`
    pub fn failure_rate(metrics: &SessionMetrics) -> f64 {
        metrics.failures as f64 / metrics.checks_performed.max(1) as f64
    }

    /// Checks per hour over `elapsed`, floored at the minimum rate window
    pub fn checks_per_hour(&self, metrics: &SessionMetrics, elapsed: Duration) -> f64 {
        let window = elapsed.max(Duration::from_secs(self.config.min_rate_window_secs.max(1)));
        metrics.checks_performed as f64 / (window.as_secs_f64() / 3600.0)
    }

    /// Risk from counters and elapsed session time; first matching row wins
    pub fn current_risk(&self, metrics: &SessionMetrics, elapsed: Duration) -> RiskLevel {
        let failure_rate = Self::failure_rate(metrics);
        let per_hour = self.checks_per_hour(metrics, elapsed);

        if failure_rate > self.config.high_failure_rate
            || per_hour > self.config.high_checks_per_hour
        {
            RiskLevel::High
        } else if failure_rate > self.config.medium_failure_rate
            || per_hour > self.config.medium_checks_per_hour
        {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Action policy for a risk level
    pub fn policy_for(&self, risk: RiskLevel) -> Policy {
        match risk {
            RiskLevel::Low => Policy {
                allow: true,
                throttle_factor: 1.0,
            },
            RiskLevel::Medium => Policy {
                allow: true,
                throttle_factor: self.config.medium_throttle_factor.max(1.0),
            },
            RiskLevel::High => Policy::blocked(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metrics(checks: u64, successes: u64, failures: u64) -> SessionMetrics {
        let mut m = SessionMetrics::new();
        m.checks_performed = checks;
        m.successes = successes;
        m.failures = failures;
        m
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_high_failure_rate_is_high_regardless_of_elapsed() {
        let assessor = RiskAssessor::default();
        let m = metrics(10, 6, 4);
        for elapsed in [Duration::ZERO, HOUR, HOUR * 1000] {
            assert_eq!(assessor.current_risk(&m, elapsed), RiskLevel::High);
        }
    }

    #[test]
    fn test_decision_table_rows() {
        let assessor = RiskAssessor::default();
        // 20% failures -> medium
        assert_eq!(
            assessor.current_risk(&metrics(10, 8, 2), HOUR),
            RiskLevel::Medium
        );
        // exactly 15% is not above the threshold
        assert_eq!(
            assessor.current_risk(&metrics(20, 17, 3), HOUR),
            RiskLevel::Low
        );
        // 90 checks in an hour -> medium
        assert_eq!(
            assessor.current_risk(&metrics(90, 90, 0), HOUR),
            RiskLevel::Medium
        );
        // 150 checks in an hour -> high
        assert_eq!(
            assessor.current_risk(&metrics(150, 150, 0), HOUR),
            RiskLevel::High
        );
        assert_eq!(
            assessor.current_risk(&metrics(5, 5, 0), HOUR),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_rate_window_floor() {
        let assessor = RiskAssessor::default();
        // Two checks in the first ten seconds are measured over 15 minutes: 8/h
        let m = metrics(2, 2, 0);
        assert_eq!(
            assessor.current_risk(&m, Duration::from_secs(10)),
            RiskLevel::Low
        );
        assert!((assessor.checks_per_hour(&m, Duration::from_secs(10)) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_scenario_200_checks_70_failures() {
        let assessor = RiskAssessor::default();
        let risk = assessor.current_risk(&metrics(200, 130, 70), HOUR * 10);
        assert_eq!(risk, RiskLevel::High);
        assert!(!assessor.policy_for(risk).allow);
    }

    #[test]
    fn test_policy_for() {
        let assessor = RiskAssessor::default();
        assert_eq!(
            assessor.policy_for(RiskLevel::Low),
            Policy {
                allow: true,
                throttle_factor: 1.0
            }
        );
        let medium = assessor.policy_for(RiskLevel::Medium);
        assert!(medium.allow);
        assert!(medium.throttle_factor > 1.0);
        assert!(!assessor.policy_for(RiskLevel::High).allow);
    }

    proptest! {
        #[test]
        fn prop_current_risk_is_deterministic(
            checks in 1u64..10_000,
            fail_pct in 0u64..=100,
            elapsed_secs in 0u64..1_000_000,
        ) {
            let failures = checks * fail_pct / 100;
            let m = metrics(checks, checks - failures, failures);
            let assessor = RiskAssessor::default();
            let elapsed = Duration::from_secs(elapsed_secs);
            prop_assert_eq!(
                assessor.current_risk(&m, elapsed),
                assessor.current_risk(&m.clone(), elapsed)
            );
        }

        #[test]
        fn prop_failure_rate_above_high_is_high(
            checks in 1u64..10_000,
            elapsed_secs in 0u64..10_000_000,
        ) {
            // strictly more than 30% failing
            let failures = (checks * 3) / 10 + 1;
            prop_assume!(failures <= checks);
            let m = metrics(checks, checks - failures, failures);
            prop_assert_eq!(
                RiskAssessor::default().current_risk(&m, Duration::from_secs(elapsed_secs)),
                RiskLevel::High
            );
        }
    }
}
