//! Tracing setup.
//!
//! Two outputs:
//!
//! - console: `fmt` layer, pretty or compact, filtered by `RUST_LOG` or the
//!   configured level;
//! - event log: one append-only file per calendar day, `<dir>/<YYYY-MM-DD>.log`,
//!   opened once at start. Lines look like
//!   `2024-03-01 14:02:11 - INFO - step 3 moved to 400.00 um`.
//!
//! [`init`] is idempotent: a second call (or a call after a test harness
//! installed its own subscriber) leaves the existing subscriber in place.

use crate::config::LogSettings;
use chrono::{Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// `<timestamp> - <LEVEL> - <message>` lines for the event-log file.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogFormat;

impl<S, N> FormatEvent<S, N> for EventLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Event-log path for a given day.
pub fn log_file_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.log", date.format("%Y-%m-%d")))
}

/// Create `dir` if needed and open today's event log for appending.
pub fn open_event_log(dir: &Path) -> Result<(File, PathBuf), String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("Failed to create log directory {}: {}", dir.display(), e))?;
    let path = log_file_path(dir, Local::now().date_naive());
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to open event log {}: {}", path.display(), e))?;
    Ok((file, path))
}

/// Install the global subscriber.
///
/// Returns the event-log path when a file is written. If a subscriber was
/// already installed nothing is replaced and `None` is returned, since the
/// file layer never receives events.
pub fn init(settings: &LogSettings) -> Result<Option<PathBuf>, String> {
    let level = parse_log_level(&settings.level)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let console = if settings.pretty {
        fmt::layer()
            .pretty()
            .with_target(false)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_filter(env_filter)
            .boxed()
    };

    let (file_layer, path) = match &settings.directory {
        Some(dir) => {
            let (file, path) = open_event_log(dir)?;
            let layer = fmt::layer()
                .event_format(EventLogFormat)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(LevelFilter::from_level(level));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    match tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
    {
        Ok(()) => Ok(path),
        // already initialized, expected in tests
        Err(e)
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set") =>
        {
            Ok(None)
        }
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
