//! Error types returned by physics and synchronization collaborators.
//!
//! These never cross the scheduler boundary: a worker that receives one
//! logs it, abandons the rest of the current block and carries on.

use std::error::Error;
use std::fmt;

/// Errors from moving or materializing a single particle.
///
/// Returned by [`PipeMover`](crate::PipeMover),
/// [`SurfaceMover`](crate::SurfaceMover) and
/// [`InjectionResolver`](crate::InjectionResolver).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MoveError {
    /// The mover could not advance the particle.
    ExecutionFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// The injection point could not be resolved to a placement.
    InjectionFailed {
        /// Injection tag (`pipe`, `manhole`, `surface`).
        kind: &'static str,
        /// Human-readable description of the failure.
        reason: String,
    },
    /// The collaborator observed the cooperative cancel flag and bailed out.
    Cancelled,
}

impl fmt::Display for MoveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionFailed { reason } => write!(f, "move failed: {reason}"),
            Self::InjectionFailed { kind, reason } => {
                write!(f, "{kind} injection failed: {reason}")
            }
            Self::Cancelled => write!(f, "cancelled by watchdog"),
        }
    }
}

impl Error for MoveError {}

/// Errors from the synchronization (measurement) collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// Measurement or bookkeeping failed for this step.
    MeasurementFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// The collaborator observed the cooperative cancel flag and bailed out.
    Cancelled,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeasurementFailed { reason } => write!(f, "measurement failed: {reason}"),
            Self::Cancelled => write!(f, "cancelled by watchdog"),
        }
    }
}

impl Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = MoveError::InjectionFailed {
            kind: "manhole",
            reason: "node 7 has no outgoing pipe".into(),
        };
        assert_eq!(
            e.to_string(),
            "manhole injection failed: node 7 has no outgoing pipe"
        );
        assert_eq!(MoveError::Cancelled.to_string(), "cancelled by watchdog");
        let s = SyncError::MeasurementFailed {
            reason: "cell lock".into(),
        };
        assert_eq!(s.to_string(), "measurement failed: cell lock");
    }
}
