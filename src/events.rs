//! Append-only scan event log.
//!
//! Every sequencer transition and device action that matters for
//! reproducing an experiment is recorded as a [`ScanEvent`]. Recording also
//! emits a tracing event, so the daily log file carries the same history.

use chrono::{DateTime, Local};
use serde::Serialize;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanEventKind {
    /// Sequencing started.
    Started,
    /// Laser armed: shot parameters set, lamp on, shutter open.
    Armed,
    /// Stage confirmed at a step position.
    MovedTo {
        /// Zero-based step index.
        step: u32,
        /// Confirmed logical position.
        position_um: f64,
    },
    /// Laser retuned.
    WavelengthSet {
        /// New wavelength.
        wavelength_nm: f64,
    },
    /// Multishot burst fired.
    Fired {
        /// Wavelength of the burst.
        wavelength_nm: f64,
    },
    /// Laser disarmed: shutter closed, lamp off.
    Disarmed,
    /// Stage back at the logical origin.
    ReturnedHome {
        /// Confirmed logical position.
        position_um: f64,
    },
    /// Scan finished with every step done and the hardware safe.
    Completed,
    /// Scan ended early.
    Aborted {
        /// Error that caused the abort.
        reason: String,
    },
}

impl std::fmt::Display for ScanEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanEventKind::Started => write!(f, "started"),
            ScanEventKind::Armed => write!(f, "armed"),
            ScanEventKind::MovedTo { step, position_um } => {
                write!(f, "step {} moved to {:.2} um", step + 1, position_um)
            }
            ScanEventKind::WavelengthSet { wavelength_nm } => {
                write!(f, "wavelength set to {} nm", wavelength_nm)
            }
            ScanEventKind::Fired { wavelength_nm } => write!(f, "fired at {} nm", wavelength_nm),
            ScanEventKind::Disarmed => write!(f, "disarmed"),
            ScanEventKind::ReturnedHome { position_um } => {
                write!(f, "returned home at {:.2} um", position_um)
            }
            ScanEventKind::Completed => write!(f, "completed"),
            ScanEventKind::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

/// A timestamped [`ScanEventKind`]. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanEvent {
    /// When it was recorded.
    pub timestamp: DateTime<Local>,
    /// What happened.
    pub kind: ScanEventKind,
}

/// Append-only list of [`ScanEvent`]s.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventLog {
    events: Vec<ScanEvent>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and emit it to the tracing subscriber.
    pub fn record(&mut self, kind: ScanEventKind) {
        match &kind {
            ScanEventKind::Aborted { .. } => tracing::error!(target: "pa_scan::events", "{}", kind),
            ScanEventKind::WavelengthSet { .. } | ScanEventKind::Fired { .. } => {
                tracing::debug!(target: "pa_scan::events", "{}", kind)
            }
            _ => tracing::info!(target: "pa_scan::events", "{}", kind),
        }
        self.events.push(ScanEvent {
            timestamp: Local::now(),
            kind,
        });
    }

    /// All events in recording order.
    pub fn events(&self) -> &[ScanEvent] {
        &self.events
    }

    /// Event kinds without timestamps, in order.
    pub fn kinds(&self) -> Vec<ScanEventKind> {
        self.events.iter().map(|e| e.kind.clone()).collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&ScanEventKind) -> bool) -> usize {
        self.events.iter().filter(|e| pred(&e.kind)).count()
    }
}
