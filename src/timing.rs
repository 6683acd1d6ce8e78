//! Named, cancellable wait points.
//!
//! The sequencer is a strictly sequential pipeline: it suspends only at a few
//! well-defined places (motion polling, settle, flashlamp warm-up, protocol
//! spacing). Each of those goes through [`Pacer`] instead of a raw timer so
//! that:
//!
//! - an external stop request ([`StopSignal::trigger`]) interrupts the wait
//!   on the next tick instead of after the loop finishes;
//! - tests drive all delays with tokio's paused clock;
//! - every wait is logged with the point it belongs to.
//!
//! Waits inside the safe-state sequence use [`Pacer::hold`], which ignores
//! the stop signal: a stop must never cut short the shutter-close delay or the
//! return-home move.

use crate::error::{ScanError, ScanResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Where in the sequence a wait happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPoint {
    /// Between two `is_moving` polls.
    MotionPoll,
    /// After a move completes.
    Settle,
    /// Between `FLASHLAMP_ON` and opening the shutter.
    FlashlampWarmup,
    /// Between retune and fire commands.
    InterCommand,
    /// After arming, before the first move.
    PreScan,
    /// After the last step, before disarming.
    PostScan,
    /// Between closing the shutter and switching the lamp off.
    ShutterClose,
}

impl std::fmt::Display for WaitPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WaitPoint::MotionPoll => "motion_poll",
            WaitPoint::Settle => "settle",
            WaitPoint::FlashlampWarmup => "flashlamp_warmup",
            WaitPoint::InterCommand => "inter_command",
            WaitPoint::PreScan => "pre_scan",
            WaitPoint::PostScan => "post_scan",
            WaitPoint::ShutterClose => "shutter_close",
        };
        write!(f, "{}", label)
    }
}

/// Shared stop request.
///
/// Cloning yields a handle to the same signal. The signal owns its sender, so
/// receivers never observe a closed channel.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    reason: Arc<parking_lot::Mutex<Option<String>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            reason: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Request a stop. The first reason wins.
    pub fn trigger(&self, reason: impl Into<String>) {
        {
            let mut r = self.reason.lock();
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.tx.send_replace(true);
    }

    /// Check whether a stop was requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Reason given to the first [`trigger`](Self::trigger) call.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Return `Err(Cancelled)` if a stop was requested.
    pub fn check(&self) -> ScanResult<()> {
        if self.is_triggered() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    fn cancelled(&self) -> ScanError {
        ScanError::Cancelled(
            self.reason()
                .unwrap_or_else(|| "stop requested".to_string()),
        )
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Wait primitive shared by the motion controller, the laser link and the sequencer.
#[derive(Clone, Default)]
pub struct Pacer {
    stop: StopSignal,
}

impl Pacer {
    /// Create a pacer bound to a stop signal.
    pub fn new(stop: StopSignal) -> Self {
        Self { stop }
    }

    /// The stop signal this pacer listens to.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Wait `duration`, returning early with `Err(Cancelled)` on a stop request.
    pub async fn pause(&self, point: WaitPoint, duration: Duration) -> ScanResult<()> {
        self.stop.check()?;
        tracing::trace!(%point, ?duration, "waiting");
        let mut rx = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = rx.wait_for(|stopped| *stopped) => {
                tracing::debug!(%point, "wait interrupted by stop request");
                Err(self.stop.cancelled())
            }
        }
    }

    /// Wait `duration` regardless of stop requests.
    pub async fn hold(&self, point: WaitPoint, duration: Duration) {
        tracing::trace!(%point, ?duration, "holding");
        tokio::time::sleep(duration).await;
    }
}
