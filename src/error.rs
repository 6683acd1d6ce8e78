//! Error types for the scan sequencer.
//!
//! Two layers of error exist:
//!
//! - **`DeviceError`**: what a hardware collaborator (stage or laser transport)
//!   reports. It carries the device label, a [`DeviceErrorKind`] and a message,
//!   the same shape as a driver error in the rest of the stack.
//! - **`ScanError`**: what the components and the sequencer report upward. It
//!   distinguishes the kinds the sequencer needs to make abort decisions:
//!
//!   | Variant | Origin | Retried? |
//!   |---|---|---|
//!   | `Config` | configuration conversion, before hardware | never |
//!   | `Safety` | `SafetyGuard`, travel checks, declined acknowledgment | never |
//!   | `DeviceTimeout` | motion polling | once, by the sequencer |
//!   | `DeviceIo` | any transport/driver failure | never |
//!   | `Cancelled` | external stop request at a wait point | never |
//!   | `Fatal` | failed disarm or return-home | never, process exits non-zero |
//!
//! `DeviceError` converts into `ScanError` with `?` and always becomes
//! `DeviceIo`, driver timeouts included. `DeviceTimeout` is only raised by the
//! motion controller's poll loop.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Device Errors
// =============================================================================

/// Failure category reported by a hardware collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Transport or link failure (socket write, serial read).
    Communication,
    /// The device did not answer or finish in time.
    Timeout,
    /// The device reported a fault.
    Hardware,
    /// The device rejected a value.
    InvalidParameter,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::Communication => "communication",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Hardware => "hardware",
            DeviceErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by [`StageDevice`](crate::hardware::StageDevice) and
/// [`LaserTransport`](crate::hardware::LaserTransport) implementations.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{device} {kind} error: {message}")]
pub struct DeviceError {
    /// Device label, e.g. `"stage"` or `"laser"`.
    pub device: String,
    /// Failure category.
    pub kind: DeviceErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DeviceError {
    /// Create a new device error.
    pub fn new(
        device: impl Into<String>,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a [`DeviceErrorKind::Communication`] error.
    pub fn communication(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DeviceErrorKind::Communication, message)
    }
}

impl From<DeviceError> for ScanError {
    fn from(err: DeviceError) -> Self {
        ScanError::DeviceIo {
            device: err.device,
            message: format!("{} ({})", err.message, err.kind),
        }
    }
}

// =============================================================================
// Safety Violations
// =============================================================================

/// A configuration or request that would put the hardware outside its safe envelope.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyViolation {
    /// Step count is zero or odd (frames are paired downstream).
    #[error("step_count must be a positive even integer, got {0}")]
    StepCount(u32),

    /// Step size is zero, negative or not finite.
    #[error("step_size_um must be positive, got {0}")]
    StepSize(f64),

    /// The full scan would exceed the physical travel ceiling.
    #[error("scan travel {travel_um} um exceeds the {max_travel_um} um ceiling")]
    TravelExceeded {
        /// Requested total travel.
        travel_um: f64,
        /// Configured ceiling.
        max_travel_um: f64,
    },

    /// No wavelengths configured.
    #[error("at least one wavelength is required")]
    NoWavelengths,

    /// A wavelength is zero, negative or not finite.
    #[error("wavelength must be positive, got {0} nm")]
    Wavelength(f64),

    /// Settle delay is zero, negative or not finite.
    #[error("settle delay must be positive, got {0} s")]
    SettleDelay(f64),

    /// Multishot burst would fire no pulses.
    #[error("multishot_count must be positive, got {0}")]
    MultishotCount(u32),

    /// A single move target lies outside the travel ceiling.
    #[error("move target {target_um} um is outside +/-{max_travel_um} um")]
    MoveOutOfRange {
        /// Requested logical target.
        target_um: f64,
        /// Configured ceiling.
        max_travel_um: f64,
    },

    /// The operator declined a required acknowledgment.
    #[error("operator did not acknowledge: {0}")]
    Unacknowledged(String),
}

// =============================================================================
// Scan Errors
// =============================================================================

/// Convenience alias for results using [`ScanError`].
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for scan sequencing.
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    /// Configuration could not be converted into a scan configuration.
    ///
    /// Raised before any hardware is touched; never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Safety check failed.
    #[error("Safety violation: {0}")]
    Safety(#[from] SafetyViolation),

    /// A device did not complete an operation in time.
    ///
    /// Only motion produces this kind. The sequencer retries the move once,
    /// then aborts.
    #[error("{device} timed out during {operation}{}", fmt_elapsed(.elapsed))]
    DeviceTimeout {
        /// Device label.
        device: String,
        /// What was being waited for.
        operation: String,
        /// How long was waited, when known.
        elapsed: Option<Duration>,
    },

    /// Transport-level failure on either device. Never retried.
    #[error("{device} I/O error: {message}")]
    DeviceIo {
        /// Device label.
        device: String,
        /// Detail.
        message: String,
    },

    /// An external stop request interrupted a wait point.
    #[error("Scan cancelled: {0}")]
    Cancelled(String),

    /// An operation was requested in a state that does not allow it.
    #[error("Cannot {action} while {state}")]
    InvalidState {
        /// Attempted operation.
        action: &'static str,
        /// Current sequencer state.
        state: String,
    },

    /// The safe-state sequence failed; the hardware may be left unsafe.
    #[error("FATAL: {0}")]
    Fatal(Box<ScanError>),
}

fn fmt_elapsed(elapsed: &Option<Duration>) -> String {
    match elapsed {
        Some(d) => format!(" after {:?}", d),
        None => String::new(),
    }
}

impl ScanError {
    /// Only motion timeouts may be retried (once).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ScanError::DeviceTimeout { .. })
    }

    /// True if the safe-state sequence itself failed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Fatal(_))
    }

    /// Escalate an error from the safe-state sequence.
    pub fn fatal(self) -> Self {
        match self {
            fatal @ ScanError::Fatal(_) => fatal,
            other => ScanError::Fatal(Box::new(other)),
        }
    }

    /// Shorthand for a [`ScanError::DeviceIo`] error.
    pub fn io(device: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::DeviceIo {
            device: device.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_timeout_converts_to_io_and_is_not_retried() {
        let err: ScanError =
            DeviceError::new("esp300", DeviceErrorKind::Timeout, "no answer to 1MD?").into();
        assert!(matches!(err, ScanError::DeviceIo { .. }));
        assert!(!err.is_recoverable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("(timeout)"));
    }

    #[test]
    fn device_communication_converts_to_io() {
        let err: ScanError = DeviceError::communication("laser", "broken pipe").into();
        assert!(matches!(err, ScanError::DeviceIo { .. }));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn fatal_does_not_nest() {
        let err = ScanError::io("laser", "down").fatal().fatal();
        match err {
            ScanError::Fatal(inner) => assert!(!inner.is_fatal()),
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn timeout_display_includes_elapsed() {
        let err = ScanError::DeviceTimeout {
            device: "stage".into(),
            operation: "move to 200 um".into(),
            elapsed: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            err.to_string(),
            "stage timed out during move to 200 um after 30s"
        );
    }

    #[test]
    fn safety_violation_display() {
        let err = ScanError::from(SafetyViolation::StepCount(3));
        assert_eq!(
            err.to_string(),
            "Safety violation: step_count must be a positive even integer, got 3"
        );
    }
}
