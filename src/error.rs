//! Custom error types for the positioning core.
//!
//! `PositionerError` is the single error type surfaced by axes, the kinematic
//! chain, the workflow scheduler and the configuration layer. It follows the
//! usual `thiserror` layout so `?` converts driver and configuration failures
//! without ceremony.
//!
//! ## Error Categories
//!
//! - **Hardware**: `Connection`, `LimitExceeded`, `AxisBusy`, `Device`.
//!   Raised synchronously at the axis boundary. A `LimitExceeded` error means
//!   no command was sent to the driver.
//! - **Motion**: `MoveVerification` and `DecompositionNonconvergence`. These
//!   are normally carried as event payloads or result flags rather than
//!   returned, because the physical move already happened (verification) or a
//!   best-effort answer is still useful (decomposition).
//! - **Workflow**: `WorkflowStall`, `WorkflowCancelled`, `WorkflowAborted`,
//!   `WorkflowBusy`.
//! - **Setup**: `Config`, `Configuration`, `InvalidArgument`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, PositionerError>;

/// Primary error type for the positioning core.
#[derive(Error, Debug, Clone)]
pub enum PositionerError {
    /// Configuration file could not be read or deserialized.
    ///
    /// **Recovery Strategy**: Abort startup and fix the configuration file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration parsed but failed semantic validation (e.g. an axis whose
    /// lower limit is above its upper limit).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The device behind an axis or peripheral could not be reached.
    ///
    /// **Error Type**: Usually transient (network glitch, IOC restart).
    #[error("Device '{device}' unreachable: {message}")]
    Connection {
        /// Axis or device name
        device: String,
        /// Driver-supplied detail
        message: String,
    },

    /// Requested target lies outside the configured travel range.
    ///
    /// Raised before any command is issued, so the hardware is untouched.
    #[error("Axis '{axis}' target {target:.4} outside limits [{lower:.4}, {upper:.4}]")]
    LimitExceeded {
        /// Axis name
        axis: String,
        /// Rejected target position
        target: f64,
        /// Lower travel limit
        lower: f64,
        /// Upper travel limit
        upper: f64,
    },

    /// A move is already in flight on this axis.
    #[error("Axis '{axis}' is busy with move {move_id}")]
    AxisBusy {
        /// Axis name
        axis: String,
        /// Correlation id of the outstanding move
        move_id: String,
    },

    /// Hardware reported completion but the final position is off target by
    /// more than precision + backlash.
    #[error(
        "Axis '{axis}' finished at {actual:.4}, expected {target:.4} (tolerance {tolerance:.4})"
    )]
    MoveVerification {
        /// Axis name
        axis: String,
        /// Commanded target
        target: f64,
        /// Position read back after completion
        actual: f64,
        /// precision + backlash
        tolerance: f64,
    },

    /// Decomposition hit its iteration cap without meeting the tolerance.
    #[error("Decomposition did not converge after {iterations} iterations (residual {residual:.4} mm)")]
    DecompositionNonconvergence {
        /// Iterations performed
        iterations: usize,
        /// Remaining translational residual in mm
        residual: f64,
    },

    /// A workflow completion trigger did not fire within its timeout.
    #[error("Workflow stalled waiting for '{item}' after {waited_ms} ms")]
    WorkflowStall {
        /// Label of the item whose trigger timed out
        item: String,
        /// Elapsed wait in milliseconds
        waited_ms: u64,
    },

    /// The workflow was cancelled while waiting on a trigger.
    #[error("Workflow cancelled while waiting for '{0}'")]
    WorkflowCancelled(String),

    /// A workflow action failed and the remaining queue was discarded.
    #[error("Workflow aborted at '{item}': {reason}")]
    WorkflowAborted {
        /// Label of the failing item
        item: String,
        /// Failure description
        reason: String,
    },

    /// Another workflow already owns the stage.
    #[error("Workflow '{0}' is already running")]
    WorkflowBusy(String),

    /// Generic device failure reported by a driver.
    #[error("Device error: {0}")]
    Device(String),

    /// Caller passed arguments that cannot describe a valid operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PositionerError {
    /// Whether retrying the same operation later can plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PositionerError::Connection { .. }
                | PositionerError::AxisBusy { .. }
                | PositionerError::MoveVerification { .. }
                | PositionerError::WorkflowStall { .. }
                | PositionerError::WorkflowBusy(_)
                | PositionerError::Device(_)
        )
    }
}

impl From<figment::Error> for PositionerError {
    fn from(value: figment::Error) -> Self {
        PositionerError::Config(value.to_string())
    }
}

impl From<anyhow::Error> for PositionerError {
    fn from(value: anyhow::Error) -> Self {
        PositionerError::Device(format!("{value:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_error_formats_bounds() {
        let err = PositionerError::LimitExceeded {
            axis: "rz".into(),
            target: 100.0,
            lower: -90.0,
            upper: 90.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("rz"));
        assert!(msg.contains("100.0000"));
        assert!(msg.contains("[-90.0000, 90.0000]"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn connection_errors_are_recoverable() {
        let err = PositionerError::Connection {
            device: "x".into(),
            message: "timeout".into(),
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn converts_anyhow_to_device_error() {
        let err: PositionerError = anyhow::anyhow!("shutter jammed").into();
        match err {
            PositionerError::Device(msg) => assert_eq!(msg, "shutter jammed"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
