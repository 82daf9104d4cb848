//! Error types for slotscout

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolState;

/// Result type for slotscout operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason codes reported inside an [`OperationResult`](crate::OperationResult).
///
/// These are the only failure details that cross the executor boundary; the
/// notification layer maps them to user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Policy refusal, retry later at lower risk
    RiskBlocked,
    /// Neither the selectors nor the text pattern found the current booking
    BookingNotFound,
    /// The change-booking control is missing
    NavigationTargetNotFound,
    /// The page never reached `readyState == "complete"`
    NavigationTimeout,
    /// The requested date is not offered
    DateNotFound,
    /// The requested time is not offered for the date
    TimeNotFound,
    /// No continue control after picking a slot
    ContinueNotFound,
    /// No confirm control on the review screen
    ConfirmNotFound,
    /// Confirm was clicked but no success indicator appeared
    ConfirmationNotDetected,
    /// The page driver itself failed
    DriverFailure,
    /// `emergency_stop()` was observed
    EmergencyStopped,
    /// Masking failed; non-fatal, logged only
    MaskingDegraded,
}

impl FailureReason {
    /// Wire name of the reason code
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RiskBlocked => "risk_blocked",
            FailureReason::BookingNotFound => "booking_not_found",
            FailureReason::NavigationTargetNotFound => "navigation_target_not_found",
            FailureReason::NavigationTimeout => "navigation_timeout",
            FailureReason::DateNotFound => "date_not_found",
            FailureReason::TimeNotFound => "time_not_found",
            FailureReason::ContinueNotFound => "continue_not_found",
            FailureReason::ConfirmNotFound => "confirm_not_found",
            FailureReason::ConfirmationNotDetected => "confirmation_not_detected",
            FailureReason::DriverFailure => "driver_failure",
            FailureReason::EmergencyStopped => "emergency_stopped",
            FailureReason::MaskingDegraded => "masking_degraded",
        }
    }

    /// Whether a later invocation may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::RiskBlocked
                | FailureReason::NavigationTimeout
                | FailureReason::DriverFailure
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for slotscout
#[derive(Debug, Error)]
pub enum Error {
    /// Page driver failure
    #[error("Driver error in {operation}: {message}")]
    Driver { operation: String, message: String },

    /// A protocol step could not complete
    #[error("Step failed: {reason}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Step {
        reason: FailureReason,
        detail: Option<String>,
    },

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The emergency stop was observed at a suspension point
    #[error("Emergency stop requested")]
    Stopped,

    /// Transition outside the protocol graph
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ProtocolState,
        to: ProtocolState,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a driver error with context
    pub fn driver(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a step failure without detail
    pub fn step(reason: FailureReason) -> Self {
        Self::Step {
            reason,
            detail: None,
        }
    }

    /// Create a step failure with detail
    pub fn step_with(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self::Step {
            reason,
            detail: Some(detail.into()),
        }
    }

    /// Check if this error is the emergency stop unwinding
    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stopped)
    }

    /// Map to the reason code reported in an operation result
    pub fn reason(&self) -> FailureReason {
        match self {
            Error::Step { reason, .. } => *reason,
            Error::Timeout(_) => FailureReason::NavigationTimeout,
            Error::Stopped => FailureReason::EmergencyStopped,
            Error::Driver { .. }
            | Error::InvalidTransition { .. }
            | Error::Config(_)
            | Error::Serialization(_)
            | Error::Io(_) => FailureReason::DriverFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_names_match_serde() {
        for reason in [
            FailureReason::RiskBlocked,
            FailureReason::BookingNotFound,
            FailureReason::ConfirmationNotDetected,
            FailureReason::MaskingDegraded,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn test_error_reason_mapping() {
        assert_eq!(
            Error::Timeout("x".into()).reason(),
            FailureReason::NavigationTimeout
        );
        assert_eq!(Error::Stopped.reason(), FailureReason::EmergencyStopped);
        assert_eq!(
            Error::driver("query", "boom").reason(),
            FailureReason::DriverFailure
        );
        assert_eq!(
            Error::step(FailureReason::TimeNotFound).reason(),
            FailureReason::TimeNotFound
        );
    }

    #[test]
    fn test_step_display_includes_detail() {
        let e = Error::step_with(FailureReason::DateNotFound, "2025-02-10");
        assert_eq!(e.to_string(), "Step failed: date_not_found (2025-02-10)");
    }
}
