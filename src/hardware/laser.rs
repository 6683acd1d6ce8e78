//! Pulsed laser control over a fire-and-forget text protocol.
//!
//! Commands are ASCII lines terminated by `\r\n`, either `KEY=VALUE` or a
//! bare verb. Nothing is read back: a command counts as delivered when the
//! transport accepts the bytes.
//!
//! [`LaserLink`] tracks what it has told the laser in a [`LaserState`]. Each
//! field starts unknown and changes only after a successful send; a failed
//! send makes that field unknown again. [`LaserLink::disarm`] uses this to
//! skip commands whose safe state is already confirmed, and to send both
//! when it is not.
//!
//! Commands are never retried: a duplicated `START_MULTISHOT` fires the
//! laser twice.

use super::capabilities::LaserTransport;
use crate::config::{ScanConfig, ShotMode};
use crate::error::{ScanError, ScanResult};
use crate::limits;
use crate::timing::{Pacer, WaitPoint};
use serde::Serialize;
use std::time::Duration;
use tracing::instrument;

/// Shutter position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Shutter {
    /// Beam can leave the head.
    Open,
    /// Beam blocked.
    Closed,
}

/// Flashlamp power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Flashlamp {
    /// Pumping.
    On,
    /// Off.
    Off,
}

/// One protocol command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaserCommand {
    /// `SET_WAVELENGTH=<nm>`
    SetWavelength(f64),
    /// `SET_POCKELSCELL_SHOT_MODE=<mode>`
    SetShotMode(ShotMode),
    /// `SET_MULTISHOT_COUNT=<n>`
    SetMultishotCount(u32),
    /// `FLASHLAMP_ON`
    FlashlampOn,
    /// `FLASHLAMP_OFF`
    FlashlampOff,
    /// `SET_SHUTTER_STATE=OPEN|CLOSE`
    SetShutter(Shutter),
    /// `START_MULTISHOT`
    StartMultishot,
}

impl LaserCommand {
    /// Wire form, including the `\r\n` terminator.
    pub fn frame(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl std::fmt::Display for LaserCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaserCommand::SetWavelength(nm) => write!(f, "SET_WAVELENGTH={}", nm),
            LaserCommand::SetShotMode(mode) => write!(f, "SET_POCKELSCELL_SHOT_MODE={}", mode),
            LaserCommand::SetMultishotCount(n) => write!(f, "SET_MULTISHOT_COUNT={}", n),
            LaserCommand::FlashlampOn => write!(f, "FLASHLAMP_ON"),
            LaserCommand::FlashlampOff => write!(f, "FLASHLAMP_OFF"),
            LaserCommand::SetShutter(Shutter::Open) => write!(f, "SET_SHUTTER_STATE=OPEN"),
            LaserCommand::SetShutter(Shutter::Closed) => write!(f, "SET_SHUTTER_STATE=CLOSE"),
            LaserCommand::StartMultishot => write!(f, "START_MULTISHOT"),
        }
    }
}

/// What the laser has been told. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaserState {
    /// Last wavelength set, nm.
    pub wavelength_nm: Option<f64>,
    /// Shutter position.
    pub shutter: Option<Shutter>,
    /// Flashlamp power.
    pub flashlamp: Option<Flashlamp>,
    /// Pockels cell shot mode.
    pub shot_mode: Option<ShotMode>,
    /// Pulses per burst.
    pub multishot_count: Option<u32>,
}

impl LaserState {
    /// Shutter confirmed closed and lamp confirmed off.
    pub fn is_safe(&self) -> bool {
        self.shutter == Some(Shutter::Closed) && self.flashlamp == Some(Flashlamp::Off)
    }

    fn apply(&mut self, command: LaserCommand, delivered: bool) {
        match command {
            LaserCommand::SetWavelength(nm) => self.wavelength_nm = delivered.then_some(nm),
            LaserCommand::SetShotMode(mode) => self.shot_mode = delivered.then_some(mode),
            LaserCommand::SetMultishotCount(n) => self.multishot_count = delivered.then_some(n),
            LaserCommand::FlashlampOn => self.flashlamp = delivered.then_some(Flashlamp::On),
            LaserCommand::FlashlampOff => self.flashlamp = delivered.then_some(Flashlamp::Off),
            LaserCommand::SetShutter(s) => self.shutter = delivered.then_some(s),
            LaserCommand::StartMultishot => {}
        }
    }
}

/// Fixed protocol delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaserTiming {
    /// Between `FLASHLAMP_ON` and opening the shutter.
    pub warmup: Duration,
    /// Between closing the shutter and `FLASHLAMP_OFF`.
    pub shutter_close_delay: Duration,
}

impl Default for LaserTiming {
    fn default() -> Self {
        Self {
            warmup: limits::FLASHLAMP_WARMUP,
            shutter_close_delay: limits::SHUTTER_CLOSE_DELAY,
        }
    }
}

/// Command framing and state tracking on top of a [`LaserTransport`].
pub struct LaserLink<T: LaserTransport> {
    transport: T,
    state: LaserState,
    timing: LaserTiming,
    pacer: Pacer,
}

impl<T: LaserTransport> LaserLink<T> {
    /// Take ownership of a connected transport. The laser state starts unknown.
    pub fn connect(transport: T, timing: LaserTiming, pacer: Pacer) -> Self {
        tracing::info!(?timing, "Laser link ready");
        Self {
            transport,
            state: LaserState::default(),
            timing,
            pacer,
        }
    }

    /// Close the transport and hand it back.
    ///
    /// Warns if the laser is not confirmed safe; the caller should have
    /// disarmed first.
    pub async fn disconnect(self) -> (T, ScanResult<()>) {
        if !self.state.is_safe() {
            tracing::warn!(state = ?self.state, "Disconnecting laser that is not confirmed safe");
        }
        let result = self.transport.close().await.map_err(ScanError::from);
        (self.transport, result)
    }

    /// Current tracked state.
    pub fn state(&self) -> &LaserState {
        &self.state
    }

    /// Frame and send one command, updating the tracked state.
    pub async fn send(&mut self, command: LaserCommand) -> ScanResult<()> {
        let frame = command.frame();
        match self.transport.send(frame.as_bytes()).await {
            Ok(()) => {
                tracing::debug!(%command, "laser command sent");
                self.state.apply(command, true);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%command, error = %err, "laser command failed");
                self.state.apply(command, false);
                Err(err.into())
            }
        }
    }

    /// Retune.
    pub async fn set_wavelength(&mut self, nm: f64) -> ScanResult<()> {
        self.send(LaserCommand::SetWavelength(nm)).await
    }

    /// Set the Pockels cell shot mode.
    pub async fn set_shot_mode(&mut self, mode: ShotMode) -> ScanResult<()> {
        self.send(LaserCommand::SetShotMode(mode)).await
    }

    /// Set pulses per burst.
    pub async fn set_multishot_count(&mut self, n: u32) -> ScanResult<()> {
        self.send(LaserCommand::SetMultishotCount(n)).await
    }

    /// Power the flashlamp.
    pub async fn flashlamp_on(&mut self) -> ScanResult<()> {
        self.send(LaserCommand::FlashlampOn).await
    }

    /// Switch the flashlamp off.
    pub async fn flashlamp_off(&mut self) -> ScanResult<()> {
        self.send(LaserCommand::FlashlampOff).await
    }

    /// Open or close the shutter.
    pub async fn set_shutter(&mut self, open: bool) -> ScanResult<()> {
        let shutter = if open { Shutter::Open } else { Shutter::Closed };
        self.send(LaserCommand::SetShutter(shutter)).await
    }

    /// Fire one multishot burst.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the shutter is not known to be open; nothing is sent.
    pub async fn fire_multishot(&mut self) -> ScanResult<()> {
        if self.state.shutter != Some(Shutter::Open) {
            return Err(ScanError::InvalidState {
                action: "fire",
                state: format!("shutter {:?}", self.state.shutter),
            });
        }
        self.send(LaserCommand::StartMultishot).await
    }

    /// Bring the laser to an emitting state.
    ///
    /// Order is fixed: first wavelength, shot mode, multishot count, lamp on,
    /// warm-up, shutter open. The stop signal is checked before anything is
    /// sent and again before the lamp is powered; the warm-up is a cancellable
    /// wait. Stops at the first failure; the caller must disarm.
    #[instrument(skip_all, err)]
    pub async fn arm(&mut self, config: &ScanConfig) -> ScanResult<()> {
        let first = config
            .wavelengths_nm
            .first()
            .copied()
            .ok_or_else(|| ScanError::Config("no wavelength to arm with".to_string()))?;

        self.pacer.stop_signal().check()?;
        self.set_wavelength(first).await?;
        self.set_shot_mode(config.shot_mode).await?;
        self.set_multishot_count(config.multishot_count).await?;
        self.pacer.stop_signal().check()?;
        self.flashlamp_on().await?;
        self.pacer
            .pause(WaitPoint::FlashlampWarmup, self.timing.warmup)
            .await?;
        self.set_shutter(true).await?;

        tracing::info!(wavelength_nm = first, "Laser armed");
        Ok(())
    }

    /// Bring the laser to its safe state: shutter closed, then lamp off.
    ///
    /// Steps already confirmed are skipped, so a second call after a
    /// successful one sends nothing. The lamp-off step is attempted even if
    /// closing the shutter failed. Waits are not cancellable.
    ///
    /// # Errors
    ///
    /// The last failure, after both steps were attempted.
    #[instrument(skip_all, err)]
    pub async fn disarm(&mut self) -> ScanResult<()> {
        let mut last_error = None;

        if self.state.shutter != Some(Shutter::Closed) {
            if let Err(err) = self.set_shutter(false).await {
                tracing::error!(error = %err, "Failed to close shutter");
                last_error = Some(err);
            }
            self.pacer
                .hold(WaitPoint::ShutterClose, self.timing.shutter_close_delay)
                .await;
        }

        if self.state.flashlamp != Some(Flashlamp::Off) {
            if let Err(err) = self.flashlamp_off().await {
                tracing::error!(error = %err, "Failed to switch flashlamp off");
                last_error = Some(err);
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => {
                tracing::info!("Laser disarmed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;
    use crate::hardware::mock::RecordingTransport;
    use crate::timing::StopSignal;
    use tokio::time::Instant;

    fn scan_config() -> ScanConfig {
        ScanConfig {
            step_count: 2,
            step_size_um: 100.0,
            wavelengths_nm: vec![430.0, 530.0],
            settle_delay: Duration::from_millis(1200),
            inter_command_delay: Duration::from_millis(200),
            pre_scan_delay: Duration::ZERO,
            direction: Direction::Forward,
            max_travel_um: 8500.0,
            shot_mode: ShotMode(2),
            multishot_count: 4,
        }
    }

    fn link(transport: &RecordingTransport) -> LaserLink<RecordingTransport> {
        LaserLink::connect(transport.clone(), LaserTiming::default(), Pacer::default())
    }

    #[test]
    fn command_framing() {
        assert_eq!(
            LaserCommand::SetWavelength(430.0).frame(),
            "SET_WAVELENGTH=430\r\n"
        );
        assert_eq!(
            LaserCommand::SetWavelength(532.5).frame(),
            "SET_WAVELENGTH=532.5\r\n"
        );
        assert_eq!(
            LaserCommand::SetShotMode(ShotMode(2)).frame(),
            "SET_POCKELSCELL_SHOT_MODE=2\r\n"
        );
        assert_eq!(
            LaserCommand::SetShutter(Shutter::Closed).frame(),
            "SET_SHUTTER_STATE=CLOSE\r\n"
        );
        assert_eq!(LaserCommand::StartMultishot.frame(), "START_MULTISHOT\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn arm_order_and_warmup() {
        let transport = RecordingTransport::new();
        let mut laser = link(&transport);

        let start = Instant::now();
        laser.arm(&scan_config()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(
            transport.commands(),
            vec![
                "SET_WAVELENGTH=430",
                "SET_POCKELSCELL_SHOT_MODE=2",
                "SET_MULTISHOT_COUNT=4",
                "FLASHLAMP_ON",
                "SET_SHUTTER_STATE=OPEN",
            ]
        );
        assert_eq!(laser.state().shutter, Some(Shutter::Open));
        assert_eq!(laser.state().flashlamp, Some(Flashlamp::On));
        assert_eq!(laser.state().wavelength_nm, Some(430.0));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_stops_at_first_failure() {
        let transport = RecordingTransport::new();
        transport.fail_on("FLASHLAMP_ON");
        let mut laser = link(&transport);

        assert!(laser.arm(&scan_config()).await.is_err());
        assert_eq!(transport.count("SET_SHUTTER_STATE"), 0);
        assert_eq!(laser.state().flashlamp, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_arm_sends_nothing() {
        let transport = RecordingTransport::new();
        let stop = StopSignal::new();
        stop.trigger("ctrl-c");
        let mut laser =
            LaserLink::connect(transport.clone(), LaserTiming::default(), Pacer::new(stop));

        let err = laser.arm(&scan_config()).await.unwrap_err();

        assert!(matches!(err, ScanError::Cancelled(_)), "unexpected: {err}");
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_twice_sends_each_command_once() {
        let transport = RecordingTransport::new();
        let mut laser = link(&transport);
        laser.arm(&scan_config()).await.unwrap();

        laser.disarm().await.unwrap();
        laser.disarm().await.unwrap();

        assert_eq!(transport.count("FLASHLAMP_OFF"), 1);
        assert_eq!(transport.count("SET_SHUTTER_STATE=CLOSE"), 1);
        assert!(laser.state().is_safe());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_from_unknown_state_sends_both() {
        let transport = RecordingTransport::new();
        let mut laser = link(&transport);

        let start = Instant::now();
        laser.disarm().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(
            transport.commands(),
            vec!["SET_SHUTTER_STATE=CLOSE", "FLASHLAMP_OFF"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_attempts_lamp_off_after_shutter_failure() {
        let transport = RecordingTransport::new();
        transport.fail_once("SET_SHUTTER_STATE=CLOSE");
        let mut laser = link(&transport);

        assert!(laser.disarm().await.is_err());
        assert_eq!(transport.commands(), vec!["FLASHLAMP_OFF"]);
        assert_eq!(laser.state().shutter, None);

        // a retry only resends what is still unconfirmed
        laser.disarm().await.unwrap();
        assert_eq!(
            transport.commands(),
            vec!["FLASHLAMP_OFF", "SET_SHUTTER_STATE=CLOSE"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn warmup_is_cancellable_but_disarm_is_not() {
        let stop = StopSignal::new();
        let transport = RecordingTransport::new();
        let mut laser =
            LaserLink::connect(transport.clone(), LaserTiming::default(), Pacer::new(stop.clone()));

        stop.trigger("operator abort");
        let err = laser.arm(&scan_config()).await.unwrap_err();
        assert!(matches!(err, ScanError::Cancelled(_)));
        assert_eq!(transport.count("SET_SHUTTER_STATE=OPEN"), 0);

        laser.disarm().await.unwrap();
        assert!(laser.state().is_safe());
    }

    #[tokio::test]
    async fn fire_requires_open_shutter() {
        let transport = RecordingTransport::new();
        let mut laser = link(&transport);

        let err = laser.fire_multishot().await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidState { .. }));
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn failed_send_is_not_retried() {
        let transport = RecordingTransport::new();
        transport.fail_once("SET_WAVELENGTH");
        let mut laser = link(&transport);

        assert!(laser.set_wavelength(530.0).await.is_err());
        assert_eq!(transport.attempts(), 1);
        assert_eq!(laser.state().wavelength_nm, None);
    }

    #[tokio::test]
    async fn disconnect_closes_transport() {
        let transport = RecordingTransport::new();
        let laser = link(&transport);
        let (_transport, result) = laser.disconnect().await;
        result.unwrap();
        assert!(transport.is_closed());
    }
}
