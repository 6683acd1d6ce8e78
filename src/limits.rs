//! Shared hard limits and protocol timings.
//!
//! This module centralizes:
//! - Physical limits of the rig (stage travel, eye-safety threshold)
//! - Laser protocol delays (warm-up, inter-command spacing)
//! - Motion polling and timeout durations
//!
//! Values match the bench the sequencer was commissioned on. They are the
//! defaults for [`RunConfig`](crate::config::RunConfig); the file and
//! environment may override all of them except where noted.

use std::time::Duration;

// =============================================================================
// Physical Limits
// =============================================================================

/// Maximum scan travel in micrometers (8.5 mm).
///
/// Beyond this the probe can collide with the fiber bundle.
pub const MAX_TRAVEL_UM: f64 = 8_500.0;

/// Wavelengths above this (nm) require the operator to confirm goggles.
pub const EYE_SAFETY_THRESHOLD_NM: f64 = 532.0;

// =============================================================================
// Laser Protocol
// =============================================================================

/// Flashlamp warm-up between `FLASHLAMP_ON` and opening the shutter.
pub const FLASHLAMP_WARMUP: Duration = Duration::from_millis(500);

/// Pause between closing the shutter and switching the flashlamp off.
pub const SHUTTER_CLOSE_DELAY: Duration = Duration::from_millis(200);

/// Spacing between retune and fire commands inside a step.
pub const INTER_COMMAND_DELAY: Duration = Duration::from_millis(200);

/// Hold after arming before the first move.
pub const PRE_SCAN_DELAY: Duration = Duration::from_secs(4);

/// Default Pockels cell shot mode.
pub const DEFAULT_SHOT_MODE: u8 = 2;

/// Default number of pulses per multishot burst.
pub const DEFAULT_MULTISHOT_COUNT: u32 = 4;

/// Timeout for opening the laser socket.
pub const LASER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Motion
// =============================================================================

/// Interval between `is_moving` polls.
pub const MOTION_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum time a single move may take before it counts as timed out.
pub const MOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default settle delay after each move.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1200);
