//! Scan orchestration.
//!
//! [`ScanSequencer`] owns the [`MotionController`] and the [`LaserLink`] for
//! the duration of a run and drives them through:
//!
//! ```text
//! Idle --validate--> Validated --zero+arm--> Armed --> Scanning --> Disarming --+--> Complete
//!                        |                     |          |             ^       |
//!                        `---------------------`----------`--(error)----'       `--> Aborted(reason)
//! ```
//!
//! Every run that gets past the acknowledgments passes through `Disarming`;
//! an aborted one settles on `Aborted` once the safe-state sequence finished.
//!
//! Scanning is position-major, wavelength-minor: at each step the stage moves
//! and settles, then every wavelength is set and fired in order. Nothing is
//! skipped, revisited or fired twice.
//!
//! Whatever happens after the first device command, the safe-state sequence
//! (laser disarm, then stage return to origin) runs exactly once. If it fails
//! the run ends with [`ScanError::Fatal`].

use crate::config::ScanConfig;
use crate::error::{SafetyViolation, ScanError, ScanResult};
use crate::events::{EventLog, ScanEvent, ScanEventKind};
use crate::hardware::{LaserLink, LaserTransport, MotionController, StageDevice, StagePosition};
use crate::safety::{AckRequirement, SafetyGuard, ValidatedConfig};
use crate::timing::{Pacer, StopSignal, WaitPoint};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{BufRead, BufReader, Stdin, Stdout, Write};
use std::time::Duration;

/// Sequencer lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScanState {
    /// Nothing validated yet.
    Idle,
    /// Configuration accepted by the safety guard.
    Validated,
    /// Laser armed, stage at origin.
    Armed,
    /// Stepping through positions.
    Scanning,
    /// Running the safe-state sequence after a complete scan.
    Disarming,
    /// All steps done, hardware safe.
    Complete,
    /// Ended early; carries the cause.
    Aborted(String),
}

impl ScanState {
    /// True for `Complete` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Complete | ScanState::Aborted(_))
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Validated => write!(f, "validated"),
            ScanState::Armed => write!(f, "armed"),
            ScanState::Scanning => write!(f, "scanning"),
            ScanState::Disarming => write!(f, "disarming"),
            ScanState::Complete => write!(f, "complete"),
            ScanState::Aborted(reason) => write!(f, "aborted ({})", reason),
        }
    }
}

/// Answers operator acknowledgment requests.
pub trait Acknowledger: Send + Sync {
    /// Return true to accept the condition and continue.
    fn acknowledge(&self, requirement: &AckRequirement) -> bool;
}

/// Accepts everything. For `--yes` runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAcknowledge;

impl Acknowledger for AutoAcknowledge {
    fn acknowledge(&self, requirement: &AckRequirement) -> bool {
        tracing::warn!(%requirement, "Acknowledged without prompting");
        true
    }
}

/// Declines everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Acknowledger for DenyAll {
    fn acknowledge(&self, _requirement: &AckRequirement) -> bool {
        false
    }
}

/// Asks an operator on a line-based prompt. The CLI wires it to the terminal.
///
/// Reading blocks, so each question runs under
/// [`tokio::task::block_in_place`]; inside a runtime this needs the
/// multi-threaded scheduler.
pub struct PromptAcknowledger<R, W> {
    io: Mutex<(R, W)>,
}

impl<R: BufRead + Send, W: Write + Send> PromptAcknowledger<R, W> {
    /// Prompt on `output`, read answers from `input`.
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }

    fn ask(&self, requirement: &AckRequirement) -> std::io::Result<bool> {
        let mut io = self.io.lock();
        let (input, output) = &mut *io;
        write!(output, "⚠️  {} Continue? [y/N] ", requirement)?;
        output.flush()?;

        let mut answer = String::new();
        input.read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

impl PromptAcknowledger<BufReader<Stdin>, Stdout> {
    /// Prompt on stdout, read from stdin.
    pub fn terminal() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R: BufRead + Send, W: Write + Send> Acknowledger for PromptAcknowledger<R, W> {
    fn acknowledge(&self, requirement: &AckRequirement) -> bool {
        match tokio::task::block_in_place(|| self.ask(requirement)) {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "Prompt failed, treating as declined");
                false
            }
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// State the sequencer ended in.
    pub final_state: ScanState,
    /// Every recorded event, in order.
    pub events: Vec<ScanEvent>,
    /// Number of positions the stage confirmed.
    pub positions_visited: usize,
    /// Number of multishot bursts fired.
    pub shots_fired: usize,
}

/// Drives one scan.
pub struct ScanSequencer<S: StageDevice, T: LaserTransport> {
    motion: MotionController<S>,
    laser: LaserLink<T>,
    guard: SafetyGuard,
    pacer: Pacer,
    state: ScanState,
    validated: Option<ValidatedConfig>,
    events: EventLog,
}

impl<S: StageDevice, T: LaserTransport> ScanSequencer<S, T> {
    /// Take ownership of both devices. Waits listen to `stop`.
    pub fn new(motion: MotionController<S>, laser: LaserLink<T>, stop: StopSignal) -> Self {
        Self {
            motion,
            laser,
            guard: SafetyGuard::default(),
            pacer: Pacer::new(stop),
            state: ScanState::Idle,
            validated: None,
            events: EventLog::new(),
        }
    }

    /// Use different safety limits.
    pub fn with_guard(mut self, guard: SafetyGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Current state.
    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Events recorded so far.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// The accepted configuration, once validated.
    pub fn validated(&self) -> Option<&ValidatedConfig> {
        self.validated.as_ref()
    }

    /// Hand the devices back.
    pub fn into_parts(self) -> (MotionController<S>, LaserLink<T>) {
        (self.motion, self.laser)
    }

    /// Snapshot of the run so far.
    pub fn report(&self) -> ScanReport {
        ScanReport {
            final_state: self.state.clone(),
            events: self.events.events().to_vec(),
            positions_visited: self
                .events
                .count(|k| matches!(k, ScanEventKind::MovedTo { .. })),
            shots_fired: self.events.count(|k| matches!(k, ScanEventKind::Fired { .. })),
        }
    }

    /// Check `config` against the safety guard. Touches no device.
    ///
    /// # Errors
    ///
    /// - `Safety` if the guard rejects it; state stays `Idle`
    /// - `InvalidState` once a run has started
    pub fn validate(&mut self, config: ScanConfig) -> ScanResult<&ValidatedConfig> {
        if !matches!(self.state, ScanState::Idle | ScanState::Validated) {
            return Err(ScanError::InvalidState {
                action: "validate",
                state: self.state.to_string(),
            });
        }

        match self.guard.validate(config) {
            Ok(validated) => {
                self.transition(ScanState::Validated);
                Ok(&*self.validated.insert(validated))
            }
            Err(violation) => {
                tracing::error!(%violation, "Configuration rejected");
                self.validated = None;
                self.state = ScanState::Idle;
                Err(violation.into())
            }
        }
    }

    /// Run the validated scan to completion or abort.
    ///
    /// Acknowledgments are asked before any device command; a declined one
    /// leaves the state at `Validated`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not `Validated`
    /// - `Safety(Unacknowledged)` if the operator declined
    /// - `Fatal` if the safe-state sequence failed
    /// - otherwise the error that aborted the scan, after the safe-state
    ///   sequence completed
    pub async fn run(&mut self, acknowledger: &dyn Acknowledger) -> ScanResult<ScanReport> {
        let validated = match (&self.state, &self.validated) {
            (ScanState::Validated, Some(validated)) => validated.clone(),
            _ => {
                return Err(ScanError::InvalidState {
                    action: "run",
                    state: self.state.to_string(),
                })
            }
        };

        self.confirm_acknowledgments(&validated, acknowledger)?;
        self.events.record(ScanEventKind::Started);

        let outcome = self.execute(&validated).await;
        if let Err(err) = &outcome {
            tracing::error!(error = %err, state = %self.state, "Scan aborted, returning to safe state");
            self.events.record(ScanEventKind::Aborted {
                reason: err.to_string(),
            });
        }

        self.transition(ScanState::Disarming);
        let cleanup = self.safe_state().await;

        match (outcome, cleanup) {
            (Ok(()), Err(fatal)) => {
                tracing::error!(error = %fatal, "FATAL: hardware may be left in an unsafe state");
                self.events.record(ScanEventKind::Aborted {
                    reason: fatal.to_string(),
                });
                self.transition(ScanState::Aborted(fatal.to_string()));
                Err(fatal)
            }
            (Err(cause), Err(fatal)) => {
                tracing::error!(error = %fatal, "FATAL: hardware may be left in an unsafe state");
                self.transition(ScanState::Aborted(cause.to_string()));
                Err(fatal)
            }
            (Err(cause), Ok(())) => {
                self.transition(ScanState::Aborted(cause.to_string()));
                Err(cause)
            }
            (Ok(()), Ok(())) => {
                self.events.record(ScanEventKind::Completed);
                self.transition(ScanState::Complete);
                Ok(self.report())
            }
        }
    }

    fn confirm_acknowledgments(
        &self,
        validated: &ValidatedConfig,
        acknowledger: &dyn Acknowledger,
    ) -> ScanResult<()> {
        let mut pending = validated.acknowledgments().to_vec();
        if !self.motion.status().homed {
            pending.push(AckRequirement::StageNotHomed);
        }

        for requirement in &pending {
            if !acknowledger.acknowledge(requirement) {
                tracing::warn!(%requirement, "Operator declined, scan not started");
                return Err(SafetyViolation::Unacknowledged(requirement.to_string()).into());
            }
            tracing::info!(%requirement, "Operator acknowledged");
        }
        Ok(())
    }

    async fn execute(&mut self, validated: &ValidatedConfig) -> ScanResult<()> {
        let config = validated.config();

        self.pacer.stop_signal().check()?;
        self.motion.zero().await?;
        let start = self.motion.move_to_origin().await?;
        tracing::info!(
            position = %start,
            n_steps = config.step_count,
            step_size_um = config.step_size_um,
            settle_delay = ?config.settle_delay,
            wavelengths_nm = ?config.wavelengths_nm,
            direction = ?config.direction,
            "Starting scan"
        );

        self.pacer.stop_signal().check()?;
        self.laser.arm(config).await?;
        self.transition(ScanState::Armed);
        self.events.record(ScanEventKind::Armed);

        self.pre_scan_hold(config.pre_scan_delay).await?;
        self.transition(ScanState::Scanning);

        let positions = validated.positions_um();
        let total = positions.len();
        for (step, target_um) in positions.into_iter().enumerate() {
            self.pacer.stop_signal().check()?;

            let target = StagePosition::from_um(target_um);
            let position = self.move_with_retry(step, target, config.settle_delay).await?;
            tracing::info!("({}/{}) moved to {:.2} um", step + 1, total, position.um());
            self.events.record(ScanEventKind::MovedTo {
                step: step as u32,
                position_um: position.um(),
            });

            for &wavelength_nm in &config.wavelengths_nm {
                self.laser.set_wavelength(wavelength_nm).await?;
                self.events
                    .record(ScanEventKind::WavelengthSet { wavelength_nm });
                self.pacer
                    .pause(WaitPoint::InterCommand, config.inter_command_delay)
                    .await?;

                self.laser.fire_multishot().await?;
                self.events.record(ScanEventKind::Fired { wavelength_nm });
                self.pacer
                    .pause(WaitPoint::InterCommand, config.inter_command_delay)
                    .await?;
            }
        }

        // every step is done; a stop here only shortens the wait
        if let Err(err) = self
            .pacer
            .pause(WaitPoint::PostScan, config.settle_delay)
            .await
        {
            tracing::info!(reason = %err, "Post-scan hold cut short");
        }
        Ok(())
    }

    async fn pre_scan_hold(&self, delay: Duration) -> ScanResult<()> {
        let mut remaining = delay;
        while !remaining.is_zero() {
            tracing::info!("Starting in {:.0} s", remaining.as_secs_f64().ceil());
            let tick = remaining.min(Duration::from_secs(1));
            self.pacer.pause(WaitPoint::PreScan, tick).await?;
            remaining -= tick;
        }
        Ok(())
    }

    async fn move_with_retry(
        &mut self,
        step: usize,
        target: StagePosition,
        settle_delay: Duration,
    ) -> ScanResult<StagePosition> {
        match self.motion.move_and_settle(target, settle_delay).await {
            Err(err) if err.is_recoverable() => {
                tracing::warn!(step, error = %err, "Move timed out, retrying once");
                self.motion.move_and_settle(target, settle_delay).await
            }
            other => other,
        }
    }

    /// Disarm the laser, then return the stage to origin. Both are attempted.
    async fn safe_state(&mut self) -> ScanResult<()> {
        let mut last_error = None;

        match self.laser.disarm().await {
            Ok(()) => self.events.record(ScanEventKind::Disarmed),
            Err(err) => {
                tracing::error!(error = %err, "FATAL: laser disarm failed");
                last_error = Some(err.fatal());
            }
        }

        match self.motion.return_home().await {
            Ok(position) => self.events.record(ScanEventKind::ReturnedHome {
                position_um: position.um(),
            }),
            Err(err) => last_error = Some(err.fatal()),
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn transition(&mut self, next: ScanState) {
        tracing::info!(from = %self.state, to = %next, "Scan state changed");
        self.state = next;
    }
}
