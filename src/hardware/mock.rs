//! Simulated hardware for tests and `--simulate` runs.
//!
//! Both mocks are cheap to clone; clones share state, so a test keeps one
//! handle for inspection while the controller owns the other. All timing uses
//! `tokio::time`, so paused-clock tests are deterministic.
//!
//! - [`SimulatedStage`]: linear stage with configurable move duration, unit
//!   scale, home state and failure injection.
//! - [`RecordingTransport`]: laser link that records every framed command and
//!   can fail selected ones.

use crate::error::{DeviceError, DeviceErrorKind};
use crate::hardware::capabilities::{LaserTransport, StageDevice, Units};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

// =============================================================================
// SimulatedStage
// =============================================================================

/// Call counters for a [`SimulatedStage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCalls {
    /// `move_to` calls, including failed ones.
    pub moves: usize,
    /// `home` calls.
    pub homes: usize,
    /// `is_moving` calls.
    pub is_moving_polls: usize,
}

#[derive(Debug)]
struct StageInner {
    units: Units,
    position_um: f64,
    homed: bool,
    move_duration: Duration,
    moving_until: Option<Instant>,
    stuck: bool,
    stall: std::ops::Range<usize>,
    stalled: bool,
    fail_moves: bool,
    targets: Vec<f64>,
    calls: StageCalls,
}

/// Simulated linear stage.
///
/// Reports positions in meters by default, like the bench stage. A move
/// updates the position immediately and reports `is_moving` for the
/// configured duration.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    inner: Arc<Mutex<StageInner>>,
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStage {
    /// Homed stage at absolute zero, meters, instantaneous moves.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StageInner {
                units: Units::Meters,
                position_um: 0.0,
                homed: true,
                move_duration: Duration::ZERO,
                moving_until: None,
                stuck: false,
                stall: 0..0,
                stalled: false,
                fail_moves: false,
                targets: Vec::new(),
                calls: StageCalls::default(),
            })),
        }
    }

    /// Start at an absolute position given in micrometers.
    pub fn with_position_um(self, um: f64) -> Self {
        self.inner.lock().position_um = um;
        self
    }

    /// Report positions in other units.
    pub fn with_units(self, units: Units) -> Self {
        self.inner.lock().units = units;
        self
    }

    /// Every move reports `is_moving` for this long.
    pub fn with_move_duration(self, duration: Duration) -> Self {
        self.inner.lock().move_duration = duration;
        self
    }

    /// Start without a home reference.
    pub fn not_homed(self) -> Self {
        self.inner.lock().homed = false;
        self
    }

    /// Never stop moving.
    pub fn stuck_moving(self) -> Self {
        self.inner.lock().stuck = true;
        self
    }

    /// Moves number `first..first + count` (zero-based, counting every
    /// `move_to` and `home` call) never finish. Later moves behave normally.
    pub fn stall_moves(&self, first: usize, count: usize) {
        self.inner.lock().stall = first..first + count;
    }

    /// Make every subsequent `move_to` fail with a communication error.
    pub fn fail_moves(&self, fail: bool) {
        self.inner.lock().fail_moves = fail;
    }

    /// Call counters so far.
    pub fn calls(&self) -> StageCalls {
        self.inner.lock().calls
    }

    /// Every `move_to` target, in device units.
    pub fn targets(&self) -> Vec<f64> {
        self.inner.lock().targets.clone()
    }

    /// Last `move_to` target, in device units.
    pub fn last_target(&self) -> Option<f64> {
        self.inner.lock().targets.last().copied()
    }

    /// Absolute position in micrometers.
    pub fn position_um(&self) -> f64 {
        self.inner.lock().position_um
    }
}

impl StageInner {
    fn scale(&self) -> f64 {
        self.units.micrometers_per_unit().unwrap_or(1.0)
    }

    fn start_motion(&mut self) {
        let index = self.calls.moves + self.calls.homes - 1;
        self.stalled = self.stall.contains(&index);
        self.moving_until = Some(Instant::now() + self.move_duration);
    }
}

#[async_trait]
impl StageDevice for SimulatedStage {
    async fn home(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.calls.homes += 1;
        inner.position_um = 0.0;
        inner.homed = true;
        inner.start_motion();
        tracing::debug!("SimulatedStage: homing");
        Ok(())
    }

    async fn move_to(&self, position: f64) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.calls.moves += 1;
        inner.targets.push(position);
        if inner.fail_moves {
            return Err(DeviceError::communication("stage", "simulated move failure"));
        }
        inner.position_um = position * inner.scale();
        inner.start_motion();
        tracing::debug!(position, units = %inner.units, "SimulatedStage: moving");
        Ok(())
    }

    async fn position(&self) -> Result<f64, DeviceError> {
        let inner = self.inner.lock();
        Ok(inner.position_um / inner.scale())
    }

    async fn is_moving(&self) -> Result<bool, DeviceError> {
        let mut inner = self.inner.lock();
        inner.calls.is_moving_polls += 1;
        if inner.stuck || inner.stalled {
            return Ok(true);
        }
        Ok(inner
            .moving_until
            .is_some_and(|until| Instant::now() < until))
    }

    async fn is_homed(&self) -> Result<bool, DeviceError> {
        Ok(self.inner.lock().homed)
    }

    async fn scale_units(&self) -> Result<Units, DeviceError> {
        Ok(self.inner.lock().units.clone())
    }
}

// =============================================================================
// RecordingTransport
// =============================================================================

#[derive(Debug, Default)]
struct TransportInner {
    sent: Vec<String>,
    attempts: usize,
    fail_always: Vec<String>,
    fail_once: Vec<String>,
    closed: bool,
}

/// Laser transport that records framed commands instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl RecordingTransport {
    /// Empty recorder, no failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command starting with `prefix` fails from now on.
    pub fn fail_on(&self, prefix: impl Into<String>) {
        self.inner.lock().fail_always.push(prefix.into());
    }

    /// The next command starting with `prefix` fails, later ones succeed.
    pub fn fail_once(&self, prefix: impl Into<String>) {
        self.inner.lock().fail_once.push(prefix.into());
    }

    /// Remove all failure injection.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.fail_always.clear();
        inner.fail_once.clear();
    }

    /// Successfully sent commands, without the line terminator.
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().sent.clone()
    }

    /// Number of successful sends starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Sends attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[async_trait]
impl LaserTransport for RecordingTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        let command = String::from_utf8_lossy(bytes).trim_end().to_string();
        let mut inner = self.inner.lock();
        inner.attempts += 1;

        if inner.closed {
            return Err(DeviceError::communication("laser", "connection closed"));
        }
        if inner.fail_always.iter().any(|p| command.starts_with(p.as_str())) {
            return Err(DeviceError::communication(
                "laser",
                format!("simulated failure sending {command}"),
            ));
        }
        if let Some(idx) = inner
            .fail_once
            .iter()
            .position(|p| command.starts_with(p.as_str()))
        {
            inner.fail_once.remove(idx);
            return Err(DeviceError::new(
                "laser",
                DeviceErrorKind::Communication,
                format!("simulated failure sending {command}"),
            ));
        }

        tracing::trace!(%command, "RecordingTransport: sent");
        inner.sent.push(command);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}
