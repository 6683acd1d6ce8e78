//! Hardware collaborator contracts.
//!
//! The sequencer talks to two external devices through narrow traits:
//!
//! - [`StageDevice`]: a motorized linear stage (home, move, position, status).
//! - [`LaserTransport`]: a byte-stream link to the laser controller.
//!
//! Everything device-specific (vendor bindings, serial framing, sockets)
//! lives behind these traits. [`MotionController`](super::MotionController)
//! and [`LaserLink`](super::LaserLink) wrap them with the scan semantics.
//!
//! # Contract
//!
//! - Methods are async (`#[async_trait]`) and take `&self`; implementations
//!   use interior mutability for their state.
//! - Implementations are `Send + Sync`.
//! - Stage positions are in the device's own scale units, reported once by
//!   [`StageDevice::scale_units`]. Conversion to micrometers happens in the
//!   motion controller, never in the driver.
//! - Errors are [`DeviceError`]s. A driver that gives up waiting reports
//!   [`DeviceErrorKind::Timeout`](crate::error::DeviceErrorKind::Timeout);
//!   it reaches the sequencer as a link failure and is never retried.

use crate::error::DeviceError;
use async_trait::async_trait;
use serde::Serialize;

/// Scale units a stage reports positions in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Units {
    /// SI meters.
    Meters,
    /// Millimeters.
    Millimeters,
    /// Micrometers.
    Micrometers,
    /// Anything else (encoder counts, steps, degrees). Cannot be normalized.
    Other(String),
}

impl Units {
    /// Micrometers per device unit, if the unit is a length.
    pub fn micrometers_per_unit(&self) -> Option<f64> {
        match self {
            Units::Meters => Some(1e6),
            Units::Millimeters => Some(1e3),
            Units::Micrometers => Some(1.0),
            Units::Other(_) => None,
        }
    }

    /// Parse a unit label such as `"m"`, `"mm"` or `"um"`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "m" => Units::Meters,
            "mm" => Units::Millimeters,
            "um" | "µm" | "micron" => Units::Micrometers,
            other => Units::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Units {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Units::Meters => write!(f, "m"),
            Units::Millimeters => write!(f, "mm"),
            Units::Micrometers => write!(f, "um"),
            Units::Other(label) => write!(f, "{}", label),
        }
    }
}

/// Capability: linear motion.
#[async_trait]
pub trait StageDevice: Send + Sync {
    /// Run the controller's homing routine. May return before it completes.
    async fn home(&self) -> Result<(), DeviceError>;

    /// Start an absolute move. Returns once the move is issued, not completed.
    async fn move_to(&self, position: f64) -> Result<(), DeviceError>;

    /// Current absolute position in scale units.
    async fn position(&self) -> Result<f64, DeviceError>;

    /// True while the stage is in motion.
    async fn is_moving(&self) -> Result<bool, DeviceError>;

    /// True if the stage has a valid home reference.
    async fn is_homed(&self) -> Result<bool, DeviceError>;

    /// Units `move_to` and `position` use.
    async fn scale_units(&self) -> Result<Units, DeviceError>;
}

/// Capability: write-only command link to the laser controller.
#[async_trait]
pub trait LaserTransport: Send + Sync {
    /// Write one framed command. Success only means the bytes were accepted.
    async fn send(&self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Release the connection. Default: nothing to release.
    async fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
