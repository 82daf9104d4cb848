//! Session context
//!
//! Everything a session owns is threaded explicitly through the executor:
//! the counters the risk assessor reads, the emergency stop handle, and the
//! masking state of the current page context.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::stealth::{HardwareProfile, MaskState};

/// Session counters.
///
/// Owned exclusively by the session and only written by the executor after
/// each invocation.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub checks_performed: u64,
    pub successes: u64,
    pub failures: u64,
    pub started_at: Instant,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            checks_performed: 0,
            successes: 0,
            failures: 0,
            started_at: Instant::now(),
        }
    }

    /// Time since the session started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// `successes / checks`, or 1.0 before the first check
    pub fn success_rate(&self) -> f64 {
        if self.checks_performed == 0 {
            1.0
        } else {
            self.successes as f64 / self.checks_performed as f64
        }
    }

    pub(crate) fn record_check(&mut self) {
        self.checks_performed += 1;
    }

    pub(crate) fn record_success(&mut self) {
        self.successes += 1;
        debug_assert!(self.successes + self.failures <= self.checks_performed);
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
        debug_assert!(self.successes + self.failures <= self.checks_performed);
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle that can halt a session from anywhere.
///
/// Cloning is cheap; every clone controls the same session. Stopping is
/// idempotent and latches until [`resume`](Self::resume).
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force the session into the blocked state
    pub fn emergency_stop(&self) {
        let token = self.lock();
        if !token.is_cancelled() {
            tracing::warn!("Emergency stop requested");
        }
        token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// Clear a latched stop so new invocations may run
    pub fn resume(&self) {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
            tracing::info!("Session resumed after emergency stop");
        }
    }

    /// Token observed by the invocation starting now
    pub(crate) fn token(&self) -> CancellationToken {
        self.lock().clone()
    }
}

/// Explicitly owned session context
#[derive(Debug)]
pub struct Session {
    metrics: SessionMetrics,
    stop: StopHandle,
    profile: HardwareProfile,
    mask: MaskState,
}

impl Session {
    /// Fresh session with a newly drawn hardware profile
    pub fn new() -> Self {
        Self::with_profile(HardwareProfile::random())
    }

    pub fn with_profile(profile: HardwareProfile) -> Self {
        Self {
            metrics: SessionMetrics::new(),
            stop: StopHandle::new(),
            profile,
            mask: MaskState::Unmasked,
        }
    }

    /// Session continuing counters carried over from an earlier run
    pub fn from_metrics(mut metrics: SessionMetrics) -> Self {
        metrics.checks_performed = metrics
            .checks_performed
            .max(metrics.successes + metrics.failures);
        Self {
            metrics,
            ..Self::new()
        }
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut SessionMetrics {
        &mut self.metrics
    }

    /// Clone of the emergency stop handle, usable from other tasks
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn emergency_stop(&self) {
        self.stop.emergency_stop();
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn mask_state(&self) -> &MaskState {
        &self.mask
    }

    pub(crate) fn set_mask_state(&mut self, state: MaskState) {
        self.mask = state;
    }

    /// External reset: zero the counters and restart the rate window
    pub fn reset_metrics(&mut self) {
        tracing::info!(
            checks = self.metrics.checks_performed,
            failures = self.metrics.failures,
            "Resetting session metrics"
        );
        self.metrics = SessionMetrics::new();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent_and_latches() {
        let handle = StopHandle::new();
        let other = handle.clone();
        assert!(!handle.is_stopped());

        other.emergency_stop();
        other.emergency_stop();
        assert!(handle.is_stopped());
        assert!(handle.token().is_cancelled());

        handle.resume();
        assert!(!other.is_stopped());
        assert!(!handle.token().is_cancelled());
    }

    #[test]
    fn test_token_taken_before_stop_observes_it() {
        let handle = StopHandle::new();
        let token = handle.token();
        handle.emergency_stop();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_success_rate() {
        let mut m = SessionMetrics::new();
        assert_eq!(m.success_rate(), 1.0);
        m.record_check();
        m.record_success();
        m.record_check();
        m.record_failure();
        assert_eq!(m.success_rate(), 0.5);
        assert!(m.successes + m.failures <= m.checks_performed);
    }

    #[tokio::test]
    async fn test_from_metrics_keeps_counters_consistent() {
        let session = Session::from_metrics(SessionMetrics {
            checks_performed: 3,
            successes: 2,
            failures: 4,
            ..SessionMetrics::new()
        });
        assert_eq!(session.metrics().checks_performed, 6);
        assert!(matches!(session.mask_state(), MaskState::Unmasked));
    }

    #[tokio::test]
    async fn test_reset_metrics() {
        let mut session = Session::new();
        session.metrics_mut().record_check();
        session.metrics_mut().record_failure();
        session.reset_metrics();
        assert_eq!(session.metrics().checks_performed, 0);
        assert_eq!(session.metrics().failures, 0);
    }
}
