//! Pre-flight safety validation.
//!
//! [`SafetyGuard::validate`] is a pure function of the configuration: it runs
//! before any device handle is opened, and a rejected configuration never
//! reaches the motion controller or the laser link.
//!
//! Some conditions are not fatal but must not pass silently either. They are
//! returned as [`AckRequirement`]s on the [`ValidatedConfig`]; the sequencer
//! refuses to arm until an [`Acknowledger`](crate::sequencer::Acknowledger)
//! has confirmed each of them.

use crate::config::ScanConfig;
use crate::error::SafetyViolation;
use crate::limits;
use serde::Serialize;

/// A condition the operator must explicitly confirm before the scan arms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AckRequirement {
    /// At least one wavelength is above the eye-safety threshold.
    WavelengthAboveThreshold {
        /// Highest configured wavelength.
        max_nm: f64,
        /// Threshold it exceeds.
        threshold_nm: f64,
    },
    /// The stage reported it is not homed when connected.
    StageNotHomed,
}

impl std::fmt::Display for AckRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckRequirement::WavelengthAboveThreshold {
                max_nm,
                threshold_nm,
            } => write!(
                f,
                "wavelength {} nm is above {} nm: correct safety goggles?",
                max_nm, threshold_nm
            ),
            AckRequirement::StageNotHomed => {
                write!(f, "stage is not homed: positions are relative to the current location")
            }
        }
    }
}

/// A configuration accepted by [`SafetyGuard`]. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedConfig {
    config: ScanConfig,
    acknowledgments: Vec<AckRequirement>,
}

impl ValidatedConfig {
    /// The validated scan.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Non-fatal conditions needing operator confirmation.
    pub fn acknowledgments(&self) -> &[AckRequirement] {
        &self.acknowledgments
    }

    /// True if any acknowledgment is pending.
    pub fn requires_operator_ack(&self) -> bool {
        !self.acknowledgments.is_empty()
    }

    /// Logical target of every step, in order.
    pub fn positions_um(&self) -> Vec<f64> {
        let sign = self.config.direction.sign();
        (0..self.config.step_count)
            .map(|i| f64::from(i) * self.config.step_size_um * sign)
            .collect()
    }

    /// Number of multishot bursts the scan fires.
    pub fn total_shots(&self) -> usize {
        self.config.step_count as usize * self.config.wavelengths_nm.len()
    }
}

/// Static hardware limits a scan is checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyGuard {
    max_travel_um: f64,
    eye_safety_threshold_nm: f64,
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new(limits::MAX_TRAVEL_UM, limits::EYE_SAFETY_THRESHOLD_NM)
    }
}

impl SafetyGuard {
    /// Create a guard for the given device ceiling and eye-safety threshold.
    pub fn new(max_travel_um: f64, eye_safety_threshold_nm: f64) -> Self {
        Self {
            max_travel_um,
            eye_safety_threshold_nm,
        }
    }

    /// Physical travel ceiling of the device.
    pub fn max_travel_um(&self) -> f64 {
        self.max_travel_um
    }

    /// Validate a scan configuration.
    ///
    /// The effective ceiling is the smaller of the device ceiling and the
    /// configuration's own `max_travel_um`.
    ///
    /// # Errors
    ///
    /// Returns the first [`SafetyViolation`] found:
    /// - `step_count` zero or odd
    /// - `step_size_um` not positive
    /// - `step_count * step_size_um` above the ceiling
    /// - no wavelengths, or a wavelength that is not positive
    /// - settle delay of zero
    /// - multishot count of zero
    pub fn validate(&self, config: ScanConfig) -> Result<ValidatedConfig, SafetyViolation> {
        if config.step_count == 0 || config.step_count % 2 != 0 {
            return Err(SafetyViolation::StepCount(config.step_count));
        }

        if !(config.step_size_um.is_finite() && config.step_size_um > 0.0) {
            return Err(SafetyViolation::StepSize(config.step_size_um));
        }

        let ceiling = self.max_travel_um.min(config.max_travel_um);
        let travel_um = config.travel_um();
        if !(travel_um <= ceiling) {
            return Err(SafetyViolation::TravelExceeded {
                travel_um,
                max_travel_um: ceiling,
            });
        }

        if config.wavelengths_nm.is_empty() {
            return Err(SafetyViolation::NoWavelengths);
        }

        if let Some(&bad) = config
            .wavelengths_nm
            .iter()
            .find(|nm| !(nm.is_finite() && **nm > 0.0))
        {
            return Err(SafetyViolation::Wavelength(bad));
        }

        if config.settle_delay.is_zero() {
            return Err(SafetyViolation::SettleDelay(
                config.settle_delay.as_secs_f64(),
            ));
        }

        if config.multishot_count == 0 {
            return Err(SafetyViolation::MultishotCount(0));
        }

        let mut acknowledgments = Vec::new();
        let max_nm = config
            .wavelengths_nm
            .iter()
            .copied()
            .fold(f64::MIN, f64::max);
        if max_nm > self.eye_safety_threshold_nm {
            tracing::warn!(
                max_nm,
                threshold_nm = self.eye_safety_threshold_nm,
                "Wavelength above eye-safety threshold, operator acknowledgment required"
            );
            acknowledgments.push(AckRequirement::WavelengthAboveThreshold {
                max_nm,
                threshold_nm: self.eye_safety_threshold_nm,
            });
        }

        Ok(ValidatedConfig {
            config,
            acknowledgments,
        })
    }
}
