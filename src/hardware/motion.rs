//! Scan-aware motion control on top of a [`StageDevice`].
//!
//! The controller owns the stage for the duration of a run and adds:
//!
//! - a logical origin ([`zero`](MotionController::zero)) so scans are
//!   expressed as micrometer offsets from wherever the probe started;
//! - unit normalization, resolved once at connect time;
//! - bounded moves: every target is checked against the travel ceiling,
//!   motion is polled at a fixed interval and times out;
//! - settle handling through the shared [`Pacer`].

use super::capabilities::{StageDevice, Units};
use crate::error::{SafetyViolation, ScanError, ScanResult};
use crate::limits;
use crate::timing::{Pacer, WaitPoint};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Logical stage position in micrometers from the scan origin.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct StagePosition(f64);

impl StagePosition {
    /// Logical origin.
    pub const ORIGIN: StagePosition = StagePosition(0.0);

    /// Position from a micrometer offset.
    pub fn from_um(um: f64) -> Self {
        Self(um)
    }

    /// Offset in micrometers.
    pub fn um(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for StagePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2} um", self.0)
    }
}

/// Motion timing and limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSettings {
    /// Largest allowed logical offset, either direction.
    pub max_travel_um: f64,
    /// Interval between `is_moving` polls.
    pub poll_interval: Duration,
    /// Time a single move may take.
    pub move_timeout: Duration,
    /// Positions closer than this to the target count as arrived.
    pub tolerance_um: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            max_travel_um: limits::MAX_TRAVEL_UM,
            poll_interval: limits::MOTION_POLL_INTERVAL,
            move_timeout: limits::MOVE_TIMEOUT,
            tolerance_um: 1.0,
        }
    }
}

/// What the stage reported when the controller connected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    /// Reported scale units.
    pub units: Units,
    /// Whether the stage had a home reference.
    pub homed: bool,
    /// Absolute position in micrometers.
    pub absolute_um: f64,
}

/// Stage wrapper used by the sequencer.
pub struct MotionController<S: StageDevice> {
    device: S,
    um_per_unit: f64,
    origin_um: f64,
    status: StageStatus,
    settings: MotionSettings,
    pacer: Pacer,
}

impl<S: StageDevice> MotionController<S> {
    /// Take ownership of a stage and read its units, home state and position.
    ///
    /// A stage that is not homed is reported, not rejected; the sequencer
    /// turns it into an operator acknowledgment.
    ///
    /// # Errors
    ///
    /// - `ScanError::Config` if the stage's units are not a length
    /// - `ScanError::DeviceIo` if any status query fails
    pub async fn connect(device: S, settings: MotionSettings, pacer: Pacer) -> ScanResult<Self> {
        let units = device.scale_units().await?;
        let um_per_unit = units.micrometers_per_unit().ok_or_else(|| {
            ScanError::Config(format!(
                "stage reports '{}' scale units, which cannot be converted to micrometers",
                units
            ))
        })?;

        let homed = device.is_homed().await?;
        let absolute_um = device.position().await? * um_per_unit;

        tracing::info!(%units, homed, absolute_um, "Stage connected");
        if !homed {
            tracing::warn!("Stage is not homed");
        }

        Ok(Self {
            device,
            um_per_unit,
            origin_um: absolute_um,
            status: StageStatus {
                units,
                homed,
                absolute_um,
            },
            settings,
            pacer,
        })
    }

    /// Release the stage.
    pub fn disconnect(self) -> S {
        tracing::debug!("Stage released");
        self.device
    }

    /// Status captured at connect time.
    pub fn status(&self) -> &StageStatus {
        &self.status
    }

    /// Motion settings in effect.
    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// Record the current physical position as the logical origin. Does not move.
    #[instrument(skip(self), err)]
    pub async fn zero(&mut self) -> ScanResult<()> {
        let absolute_um = self.absolute_um().await?;
        self.origin_um = absolute_um;
        tracing::info!(origin_um = absolute_um, "Logical origin set");
        Ok(())
    }

    /// Current logical position.
    pub async fn current_position(&self) -> ScanResult<StagePosition> {
        let absolute_um = self.absolute_um().await?;
        Ok(StagePosition(absolute_um - self.origin_um))
    }

    /// Move to `target`, wait for motion to stop, then wait `settle_delay`.
    ///
    /// Motion is polled every `poll_interval`; the stop signal is checked at
    /// every poll and during the settle delay.
    ///
    /// # Errors
    ///
    /// - `Safety(MoveOutOfRange)` before anything is sent, if the target is
    ///   outside the travel ceiling
    /// - `DeviceTimeout` if the stage is still moving after `move_timeout`
    ///   (recoverable)
    /// - `Cancelled` on a stop request
    /// - `DeviceIo` on any device failure
    #[instrument(skip(self, target), fields(target_um = target.um()), err)]
    pub async fn move_and_settle(
        &mut self,
        target: StagePosition,
        settle_delay: Duration,
    ) -> ScanResult<StagePosition> {
        self.issue_move(target).await?;
        self.wait_until_stopped(target, true).await?;
        self.pacer.pause(WaitPoint::Settle, settle_delay).await?;

        let position = self.current_position().await?;
        if (position.um() - target.um()).abs() > self.settings.tolerance_um {
            tracing::warn!(
                requested = target.um(),
                reported = position.um(),
                "Stage stopped away from target"
            );
        }
        Ok(position)
    }

    /// Move to the logical origin at scan start.
    ///
    /// Same as [`return_home`](Self::return_home) except that motion is
    /// polled like a scan move, so a stop request interrupts it with a plain
    /// `Cancelled`. Other failures are escalated as fatal.
    #[instrument(skip(self), err)]
    pub async fn move_to_origin(&mut self) -> ScanResult<StagePosition> {
        self.go_to_origin(true).await
    }

    /// Move to the logical origin and wait for completion.
    ///
    /// Used at scan end. Not interrupted by stop requests: this is part of
    /// the safe-state sequence. Any failure is escalated as fatal.
    #[instrument(skip(self), err)]
    pub async fn return_home(&mut self) -> ScanResult<StagePosition> {
        self.go_to_origin(false).await
    }

    /// Run the controller's homing routine and wait for it to finish.
    ///
    /// Never called by the sequencer; homing is an explicit operator action.
    #[instrument(skip(self), err)]
    pub async fn home(&mut self) -> ScanResult<()> {
        self.device.home().await?;
        self.wait_until_stopped(StagePosition::ORIGIN, true).await?;
        self.status.homed = self.device.is_homed().await?;
        self.status.absolute_um = self.absolute_um().await?;
        self.origin_um = self.status.absolute_um;
        tracing::info!(homed = self.status.homed, "Stage homing finished");
        Ok(())
    }

    async fn go_to_origin(&self, cancellable: bool) -> ScanResult<StagePosition> {
        let result: ScanResult<StagePosition> = async {
            self.issue_move(StagePosition::ORIGIN).await?;
            self.wait_until_stopped(StagePosition::ORIGIN, cancellable).await?;
            self.current_position().await
        }
        .await;

        match result {
            Ok(position) => {
                tracing::info!(%position, "Stage at origin");
                Ok(position)
            }
            Err(cancelled @ ScanError::Cancelled(_)) => Err(cancelled),
            Err(err) => {
                tracing::error!(error = %err, "FATAL: return to origin failed, stage may be unsafe");
                Err(err.fatal())
            }
        }
    }

    async fn absolute_um(&self) -> ScanResult<f64> {
        Ok(self.device.position().await? * self.um_per_unit)
    }

    async fn issue_move(&self, target: StagePosition) -> ScanResult<()> {
        if !(target.um().abs() <= self.settings.max_travel_um) {
            return Err(SafetyViolation::MoveOutOfRange {
                target_um: target.um(),
                max_travel_um: self.settings.max_travel_um,
            }
            .into());
        }

        let absolute = (self.origin_um + target.um()) / self.um_per_unit;
        tracing::debug!(target_um = target.um(), absolute, "Issuing move");
        self.device.move_to(absolute).await?;
        Ok(())
    }

    async fn wait_until_stopped(&self, target: StagePosition, cancellable: bool) -> ScanResult<()> {
        let start = Instant::now();
        loop {
            if !self.device.is_moving().await? {
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.settings.move_timeout {
                return Err(ScanError::DeviceTimeout {
                    device: "stage".to_string(),
                    operation: format!("move to {}", target),
                    elapsed: Some(elapsed),
                });
            }

            if cancellable {
                self.pacer
                    .pause(WaitPoint::MotionPoll, self.settings.poll_interval)
                    .await?;
            } else {
                self.pacer
                    .hold(WaitPoint::MotionPoll, self.settings.poll_interval)
                    .await;
            }
        }
    }
}
