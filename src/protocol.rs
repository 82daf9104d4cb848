//! Interaction protocol state machine
//!
//! One [`ProtocolRun`] per invocation. It only tracks and validates
//! transitions; the executor performs the work of each state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::booking::{CandidateSlot, CurrentBooking};
use crate::error::{Error, FailureReason, Result};
use crate::risk::RiskLevel;

/// Protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolState {
    Idle,
    Precheck,
    Warmup,
    ReadBooking,
    Navigate,
    Search,
    Execute,
    Review,
    Confirm,
    Done,
    Failed,
    EmergencyStopped,
}

impl ProtocolState {
    /// Terminal for the current invocation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolState::Done | ProtocolState::Failed | ProtocolState::EmergencyStopped
        )
    }

    /// Whether the protocol graph has an edge `self -> next`
    pub fn can_transition_to(&self, next: ProtocolState) -> bool {
        use ProtocolState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | EmergencyStopped) {
            return true;
        }
        matches!(
            (*self, next),
            (Idle, Precheck)
                | (Precheck, Warmup)
                | (Warmup, ReadBooking)
                | (ReadBooking, Navigate)
                | (Navigate, Search)
                | (Search, Execute)
                | (Search, Done)
                | (Execute, Review)
                | (Review, Confirm)
                | (Confirm, Done)
        )
    }
}

/// Transition log of one invocation
#[derive(Debug, Clone)]
pub struct ProtocolRun {
    state: ProtocolState,
    trace: Vec<ProtocolState>,
}

impl Default for ProtocolRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRun {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Idle,
            trace: vec![ProtocolState::Idle],
        }
    }

    /// Run that has taken the `Idle -> Precheck` edge
    pub fn begin() -> Self {
        Self {
            state: ProtocolState::Precheck,
            trace: vec![ProtocolState::Idle, ProtocolState::Precheck],
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// States visited so far, starting with `Idle`
    pub fn trace(&self) -> &[ProtocolState] {
        &self.trace
    }

    /// Move to `next`, rejecting edges outside the protocol graph
    pub fn advance(&mut self, next: ProtocolState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "Protocol transition");
        self.state = next;
        self.trace.push(next);
        Ok(())
    }

    /// Enter `Execute`; only possible with at least one candidate slot
    pub fn begin_execute(&mut self, slots: &[CandidateSlot]) -> Result<()> {
        if slots.is_empty() {
            return Err(Error::step_with(
                FailureReason::DateNotFound,
                "search produced no candidate slots",
            ));
        }
        self.advance(ProtocolState::Execute)
    }

    /// Force a terminal state from wherever the run is
    pub(crate) fn terminate(&mut self, terminal: ProtocolState) {
        debug_assert!(terminal.is_terminal());
        if self.state.is_terminal() {
            return;
        }
        self.state = terminal;
        self.trace.push(terminal);
    }
}

/// Externally visible outcome of a `check` or `execute_change` call.
///
/// Session counters only move for runs that passed the precheck. A result
/// with `blocked: true` and `error: risk_blocked` (or a stop refused before
/// the run began) left `checks_performed`, `successes` and `failures` as
/// they were.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub risk_level: RiskLevel,
    pub slots_found: Vec<CandidateSlot>,
    /// Refused by policy or halted by the emergency stop; a refused run
    /// counted nothing
    pub blocked: bool,
    pub error: Option<FailureReason>,
    /// Context for `error`
    pub detail: Option<String>,
    pub final_state: ProtocolState,
    pub current_booking: Option<CurrentBooking>,
    /// Delay multiplier in force during the run
    pub throttle_factor: f64,
    /// States visited, in order
    pub trace: Vec<ProtocolState>,
}

impl OperationResult {
    /// Serialize for the notification layer
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProtocolState::*;

    #[test]
    fn test_happy_path_is_accepted() {
        let mut run = ProtocolRun::new();
        for s in [
            Precheck,
            Warmup,
            ReadBooking,
            Navigate,
            Search,
            Execute,
            Review,
            Confirm,
            Done,
        ] {
            run.advance(s).unwrap();
        }
        assert_eq!(run.state(), Done);
        assert_eq!(run.trace().len(), 10);
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut run = ProtocolRun::new();
        assert!(run.advance(Search).is_err());
        run.advance(Precheck).unwrap();
        assert!(matches!(
            run.advance(Confirm),
            Err(Error::InvalidTransition {
                from: Precheck,
                to: Confirm
            })
        ));
    }

    #[test]
    fn test_failure_and_stop_reachable_from_any_live_state() {
        for s in [Idle, Precheck, Warmup, ReadBooking, Navigate, Search, Execute, Review, Confirm] {
            assert!(s.can_transition_to(Failed));
            assert!(s.can_transition_to(EmergencyStopped));
        }
        for t in [Done, Failed, EmergencyStopped] {
            assert!(!t.can_transition_to(Failed));
            assert!(!t.can_transition_to(Precheck));
        }
    }

    #[test]
    fn test_execute_requires_candidates() {
        let mut run = ProtocolRun::new();
        for s in [Precheck, Warmup, ReadBooking, Navigate, Search] {
            run.advance(s).unwrap();
        }
        assert!(run.begin_execute(&[]).is_err());
        assert_eq!(run.state(), Search);
        assert!(!run.trace().contains(&Execute));
    }

    #[test]
    fn test_terminate_is_sticky() {
        let mut run = ProtocolRun::new();
        run.advance(Precheck).unwrap();
        run.terminate(EmergencyStopped);
        run.terminate(Failed);
        assert_eq!(run.state(), EmergencyStopped);
        assert_eq!(run.trace(), &[Idle, Precheck, EmergencyStopped]);
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&EmergencyStopped).unwrap(),
            "\"EMERGENCY_STOPPED\""
        );
        assert_eq!(
            serde_json::to_string(&ReadBooking).unwrap(),
            "\"READ_BOOKING\""
        );
    }
}
