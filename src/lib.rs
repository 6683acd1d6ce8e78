//! # Photoacoustic Scan Sequencer
//!
//! Drives a motorized linear stage and a tunable pulsed laser through a
//! multi-wavelength photoacoustic sweep: at each of N positions the stage
//! moves and settles, then the laser is retuned and fires a multishot burst
//! for every configured wavelength. Every step is logged to a daily event
//! log.
//!
//! ## Crate Structure
//!
//! - **`config`**: `ScanConfig` and the TOML/environment `RunConfig` surface.
//! - **`safety`**: `SafetyGuard`, the pre-flight check every scan passes
//!   before any device is touched.
//! - **`hardware`**: collaborator traits (`StageDevice`, `LaserTransport`),
//!   the `MotionController` and `LaserLink` built on them, and the concrete
//!   ESP300, TCP and simulated devices.
//! - **`sequencer`**: `ScanSequencer`, the arm → scan → disarm state machine.
//! - **`timing`**: `StopSignal` and the cancellable `Pacer` wait points.
//! - **`events`**: the append-only `EventLog`.
//! - **`logging`**: tracing setup with the daily event-log file.
//! - **`error`** and **`limits`**: error types and hardware constants.
//!
//! ## Example
//!
//! ```no_run
//! use pa_scan::config::RunConfig;
//! use pa_scan::hardware::{
//!     LaserLink, LaserTiming, MotionController, MotionSettings, RecordingTransport,
//!     SimulatedStage,
//! };
//! use pa_scan::sequencer::{AutoAcknowledge, ScanSequencer};
//! use pa_scan::timing::{Pacer, StopSignal};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::default();
//! let stop = StopSignal::new();
//! let pacer = Pacer::new(stop.clone());
//!
//! let motion =
//!     MotionController::connect(SimulatedStage::new(), MotionSettings::default(), pacer.clone())
//!         .await?;
//! let laser = LaserLink::connect(RecordingTransport::new(), LaserTiming::default(), pacer);
//!
//! let mut sequencer = ScanSequencer::new(motion, laser, stop);
//! sequencer.validate(config.scan_config()?)?;
//! let report = sequencer.run(&AutoAcknowledge).await?;
//! println!("{} shots fired", report.shots_fired);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod limits;
pub mod logging;
pub mod safety;
pub mod sequencer;
pub mod timing;

pub use error::{DeviceError, DeviceErrorKind, SafetyViolation, ScanError, ScanResult};
pub use sequencer::{ScanReport, ScanSequencer, ScanState};
