//! Scan configuration.
//!
//! Two layers:
//!
//! - [`ScanConfig`]: the in-memory description of one scan. It is what
//!   [`SafetyGuard`](crate::safety::SafetyGuard) validates and what the
//!   sequencer runs. It carries no I/O settings.
//! - [`RunConfig`]: the process-level surface, loaded with Figment from a TOML
//!   file and environment variables prefixed `PA_SCAN_`. It holds the scan
//!   section plus device addresses and logging settings, and converts into a
//!   `ScanConfig`.
//!
//! # Example
//!
//! ```toml
//! [scan]
//! step_count = 30
//! step_size_um = 200.0
//! wavelengths_nm = [430.0, 530.0, 630.0]
//! settle_delay_s = 1.2
//! direction = "forward"
//!
//! [laser]
//! host = "192.168.12.223"
//! port = 1025
//! ```
//!
//! Environment overrides use a double underscore between section and key:
//! `PA_SCAN_SCAN__STEP_COUNT=10`.

use crate::error::{ScanError, ScanResult};
use crate::limits;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Scan Configuration
// =============================================================================

/// Direction of stage travel relative to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards the fiber bundle (positive offsets).
    #[default]
    Forward,
    /// Away from the fiber bundle (negative offsets).
    Backward,
}

impl Direction {
    /// `+1.0` or `-1.0`.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
        }
    }
}

/// Pockels cell shot mode, sent verbatim as `SET_POCKELSCELL_SHOT_MODE=<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShotMode(pub u8);

impl Default for ShotMode {
    fn default() -> Self {
        ShotMode(limits::DEFAULT_SHOT_MODE)
    }
}

impl std::fmt::Display for ShotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One scan, as run by the sequencer.
///
/// Construct freely; it only becomes runnable once
/// [`SafetyGuard::validate`](crate::safety::SafetyGuard::validate) accepts it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanConfig {
    /// Number of positions. Must be positive and even.
    pub step_count: u32,
    /// Distance between positions in micrometers.
    pub step_size_um: f64,
    /// Wavelengths fired at every position, in order. Duplicates allowed.
    pub wavelengths_nm: Vec<f64>,
    /// Pause after each move before firing.
    pub settle_delay: Duration,
    /// Pause between retune and fire commands.
    pub inter_command_delay: Duration,
    /// Hold after arming before the first move.
    pub pre_scan_delay: Duration,
    /// Direction of travel.
    pub direction: Direction,
    /// Hard travel ceiling in micrometers.
    pub max_travel_um: f64,
    /// Pockels cell shot mode set while arming.
    pub shot_mode: ShotMode,
    /// Pulses per multishot burst, set while arming.
    pub multishot_count: u32,
}

impl ScanConfig {
    /// Total scan travel (`step_count * step_size_um`).
    pub fn travel_um(&self) -> f64 {
        f64::from(self.step_count) * self.step_size_um
    }
}

// =============================================================================
// Run Configuration (file + environment)
// =============================================================================

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunConfig {
    /// Scan geometry and timing.
    #[serde(default)]
    pub scan: ScanSettings,
    /// Safety limits.
    #[serde(default)]
    pub limits: LimitSettings,
    /// Laser connection and arming parameters.
    #[serde(default)]
    pub laser: LaserSettings,
    /// Stage driver selection and motion timing.
    #[serde(default)]
    pub stage: StageSettings,
    /// Console and event-log output.
    #[serde(default)]
    pub logging: LogSettings,
}

/// `[scan]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Number of positions (even).
    pub step_count: u32,
    /// Step size in micrometers.
    pub step_size_um: f64,
    /// Wavelength list in nanometers.
    pub wavelengths_nm: Vec<f64>,
    /// Settle delay after each move, seconds.
    pub settle_delay_s: f64,
    /// Delay between retune and fire commands, seconds.
    pub inter_command_delay_s: f64,
    /// Hold after arming, seconds.
    pub pre_scan_delay_s: f64,
    /// Direction of travel.
    pub direction: Direction,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            step_count: 30,
            step_size_um: 200.0,
            wavelengths_nm: vec![430.0, 530.0, 630.0],
            settle_delay_s: limits::DEFAULT_SETTLE_DELAY.as_secs_f64(),
            inter_command_delay_s: limits::INTER_COMMAND_DELAY.as_secs_f64(),
            pre_scan_delay_s: limits::PRE_SCAN_DELAY.as_secs_f64(),
            direction: Direction::Forward,
        }
    }
}

impl ScanSettings {
    /// Convert into a [`ScanConfig`]. Fails on negative or non-finite durations.
    pub fn to_scan_config(
        &self,
        max_travel_um: f64,
        laser: &LaserSettings,
    ) -> ScanResult<ScanConfig> {
        Ok(ScanConfig {
            step_count: self.step_count,
            step_size_um: self.step_size_um,
            wavelengths_nm: self.wavelengths_nm.clone(),
            settle_delay: seconds("scan.settle_delay_s", self.settle_delay_s)?,
            inter_command_delay: seconds(
                "scan.inter_command_delay_s",
                self.inter_command_delay_s,
            )?,
            pre_scan_delay: seconds("scan.pre_scan_delay_s", self.pre_scan_delay_s)?,
            direction: self.direction,
            max_travel_um,
            shot_mode: laser.shot_mode,
            multishot_count: laser.multishot_count,
        })
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Travel ceiling in micrometers.
    pub max_travel_um: f64,
    /// Wavelengths above this need operator acknowledgment.
    pub eye_safety_threshold_nm: f64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_travel_um: limits::MAX_TRAVEL_UM,
            eye_safety_threshold_nm: limits::EYE_SAFETY_THRESHOLD_NM,
        }
    }
}

/// `[laser]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserSettings {
    /// Laser controller address.
    pub host: String,
    /// Remote client port.
    pub port: u16,
    /// Pockels cell shot mode.
    pub shot_mode: ShotMode,
    /// Pulses per multishot burst.
    pub multishot_count: u32,
    /// Flashlamp warm-up before opening the shutter, seconds.
    pub warmup_s: f64,
    /// Delay between shutter close and lamp off, seconds.
    pub shutter_close_delay_s: f64,
    /// Socket connect timeout, seconds.
    pub connect_timeout_s: f64,
}

impl Default for LaserSettings {
    fn default() -> Self {
        Self {
            host: "192.168.12.223".to_string(),
            port: 1025,
            shot_mode: ShotMode::default(),
            multishot_count: limits::DEFAULT_MULTISHOT_COUNT,
            warmup_s: limits::FLASHLAMP_WARMUP.as_secs_f64(),
            shutter_close_delay_s: limits::SHUTTER_CLOSE_DELAY.as_secs_f64(),
            connect_timeout_s: limits::LASER_CONNECT_TIMEOUT.as_secs_f64(),
        }
    }
}

impl LaserSettings {
    /// Flashlamp warm-up as a duration.
    pub fn warmup(&self) -> ScanResult<Duration> {
        seconds("laser.warmup_s", self.warmup_s)
    }

    /// Shutter-close delay as a duration.
    pub fn shutter_close_delay(&self) -> ScanResult<Duration> {
        seconds("laser.shutter_close_delay_s", self.shutter_close_delay_s)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> ScanResult<Duration> {
        seconds("laser.connect_timeout_s", self.connect_timeout_s)
    }
}

/// Which stage collaborator to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageDriver {
    /// In-process simulated stage.
    #[default]
    Simulated,
    /// Newport ESP300 over RS-232.
    Esp300,
}

/// `[stage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Driver selection.
    pub driver: StageDriver,
    /// Serial port path for hardware drivers.
    pub port: String,
    /// Controller axis (1-3).
    pub axis: u8,
    /// Interval between `is_moving` polls, milliseconds.
    pub poll_interval_ms: u64,
    /// Move timeout, seconds.
    pub move_timeout_s: f64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            driver: StageDriver::Simulated,
            port: "/dev/ttyUSB0".to_string(),
            axis: 1,
            poll_interval_ms: limits::MOTION_POLL_INTERVAL.as_millis() as u64,
            move_timeout_s: limits::MOVE_TIMEOUT.as_secs_f64(),
        }
    }
}

impl StageSettings {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Move timeout as a duration.
    pub fn move_timeout(&self) -> ScanResult<Duration> {
        seconds("stage.move_timeout_s", self.move_timeout_s)
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Directory for the daily event log. `None` disables the file.
    pub directory: Option<PathBuf>,
    /// Pretty multi-line console output instead of compact lines.
    pub pretty: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            directory: Some(PathBuf::from("logs")),
            pretty: false,
        }
    }
}

impl RunConfig {
    /// Load from a TOML file and `PA_SCAN_` environment variables.
    ///
    /// Missing keys fall back to the defaults; a missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(RunConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PA_SCAN_").split("__"))
            .extract()
    }

    /// Validate the non-scan settings. Scan geometry is the
    /// [`SafetyGuard`](crate::safety::SafetyGuard)'s job.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.laser.port == 0 {
            return Err("laser.port must be greater than 0".to_string());
        }

        if self.laser.host.trim().is_empty() {
            return Err("laser.host cannot be empty".to_string());
        }

        if !(1..=3).contains(&self.stage.axis) {
            return Err(format!("stage.axis must be 1-3, got {}", self.stage.axis));
        }

        if self.stage.poll_interval_ms == 0 {
            return Err("stage.poll_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// The scan this configuration describes.
    pub fn scan_config(&self) -> ScanResult<ScanConfig> {
        self.scan
            .to_scan_config(self.limits.max_travel_um, &self.laser)
    }

    /// Laser endpoint as `host:port`.
    pub fn laser_address(&self) -> String {
        format!("{}:{}", self.laser.host, self.laser.port)
    }
}

fn seconds(field: &str, value: f64) -> ScanResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ScanError::Config(format!(
            "{field} must be a finite, non-negative number of seconds, got {value}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_bench_setup() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());

        let scan = config.scan_config().unwrap();
        assert_eq!(scan.step_count, 30);
        assert_eq!(scan.wavelengths_nm, vec![430.0, 530.0, 630.0]);
        assert_eq!(scan.settle_delay, Duration::from_millis(1200));
        assert_eq!(scan.shot_mode, ShotMode(2));
        assert_eq!(scan.multishot_count, 4);
        assert_eq!(scan.travel_um(), 6000.0);
        assert_eq!(config.laser_address(), "192.168.12.223:1025");
    }

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Forward.sign(), 1.0);
        assert_eq!(Direction::Backward.sign(), -1.0);
    }

    #[test]
    fn negative_delay_is_config_error() {
        let settings = ScanSettings {
            settle_delay_s: -1.0,
            ..Default::default()
        };
        let err = settings
            .to_scan_config(8500.0, &LaserSettings::default())
            .unwrap_err();
        assert!(matches!(err, ScanError::Config(msg) if msg.contains("settle_delay_s")));
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [scan]
            step_count = 4
            step_size_um = 250.0
            wavelengths_nm = [700.0]
            direction = "backward"

            [laser]
            host = "10.0.0.5"
            port = 2000

            [stage]
            driver = "esp300"
            port = "/dev/ttyS0"
            "#
        )
        .unwrap();

        let config = RunConfig::load_from(file.path()).unwrap();
        assert_eq!(config.scan.step_count, 4);
        assert_eq!(config.scan.direction, Direction::Backward);
        assert_eq!(config.stage.driver, StageDriver::Esp300);
        assert_eq!(config.laser_address(), "10.0.0.5:2000");
        // untouched sections keep their defaults
        assert_eq!(config.limits.max_travel_um, 8500.0);
        assert_eq!(config.laser.multishot_count, 4);
    }

    #[test]
    fn validation_rejects_bad_log_level() {
        let mut config = RunConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));
    }

    #[test]
    fn validation_rejects_zero_port_and_bad_axis() {
        let mut config = RunConfig::default();
        config.laser.port = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.stage.axis = 4;
        assert!(config.validate().is_err());
    }
}
