//! CLI entry point for the photoacoustic scan sequencer.
//!
//! ```bash
//! pa-scan check --config scan.toml
//! pa-scan run --config scan.toml [--simulate] [--yes] [--report run.json]
//! pa-scan home --config scan.toml [--simulate]
//! ```
//!
//! Exit codes for `run`: 0 complete, 1 aborted (hardware safe), 2 fatal
//! (safe-state sequence failed, check the rig).

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pa_scan::config::{RunConfig, ScanConfig, StageDriver, StageSettings};
use pa_scan::hardware::{
    Esp300Stage, LaserLink, LaserTiming, LaserTransport, MotionController, MotionSettings,
    RecordingTransport, SimulatedStage, StageDevice, TcpTransport,
};
use pa_scan::safety::SafetyGuard;
use pa_scan::sequencer::{Acknowledger, AutoAcknowledge, PromptAcknowledger, ScanSequencer};
use pa_scan::timing::{Pacer, StopSignal};
use pa_scan::{logging, ScanError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pa-scan")]
#[command(about = "Photoacoustic stage + laser scan sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration and print the scan plan. Opens no device.
    Check {
        /// TOML configuration file
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Run a scan
    Run(RunArgs),

    /// Home the stage (never done implicitly by `run`)
    Home {
        /// TOML configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Use the simulated stage
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// TOML configuration file
    #[arg(long, short)]
    config: PathBuf,

    /// Use simulated stage and laser
    #[arg(long)]
    simulate: bool,

    /// Accept every operator acknowledgment without prompting
    #[arg(long)]
    yes: bool,

    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => check(&config),
        Commands::Run(args) => run(args).await,
        Commands::Home { config, simulate } => home(&config, simulate).await,
    }
}

fn load_config(path: &Path) -> Result<RunConfig> {
    let config = RunConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;
    Ok(config)
}

fn guard(config: &RunConfig) -> SafetyGuard {
    SafetyGuard::new(
        config.limits.max_travel_um,
        config.limits.eye_safety_threshold_nm,
    )
}

fn motion_settings(config: &RunConfig) -> Result<MotionSettings> {
    Ok(MotionSettings {
        max_travel_um: config.limits.max_travel_um,
        poll_interval: config.stage.poll_interval(),
        move_timeout: config.stage.move_timeout()?,
        ..MotionSettings::default()
    })
}

fn check(path: &Path) -> Result<ExitCode> {
    let config = load_config(path)?;
    let validated = guard(&config).validate(config.scan_config()?)?;
    let scan = validated.config();

    println!("✅ Configuration OK: {}", path.display());
    println!(
        "   {} steps of {} um ({:?}), {} um total",
        scan.step_count,
        scan.step_size_um,
        scan.direction,
        scan.travel_um()
    );
    println!("   Wavelengths: {:?} nm", scan.wavelengths_nm);
    println!(
        "   Shots: {} bursts of {}",
        validated.total_shots(),
        scan.multishot_count
    );
    println!("   Positions: {:?}", validated.positions_um());
    for requirement in validated.acknowledgments() {
        println!("⚠️  Needs acknowledgment: {}", requirement);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args.config)?;
    if let Some(path) = logging::init(&config.logging).map_err(anyhow::Error::msg)? {
        println!("📝 Event log: {}", path.display());
    }

    // reject bad scans before any device is opened
    let scan = config.scan_config()?;
    guard(&config).validate(scan.clone())?;

    if args.simulate {
        let stage = SimulatedStage::new().with_move_duration(Duration::from_millis(300));
        return execute(stage, RecordingTransport::new(), &config, scan, &args).await;
    }

    let transport = TcpTransport::connect(
        &config.laser.host,
        config.laser.port,
        config.laser.connect_timeout()?,
    )
    .await
    .with_context(|| format!("Failed to connect to laser at {}", config.laser_address()))?;

    match config.stage.driver {
        StageDriver::Simulated => {
            execute(SimulatedStage::new(), transport, &config, scan, &args).await
        }
        StageDriver::Esp300 => {
            let stage = open_esp300(&config.stage)?;
            execute(stage, transport, &config, scan, &args).await
        }
    }
}

async fn execute<S: StageDevice, T: LaserTransport>(
    stage: S,
    transport: T,
    config: &RunConfig,
    scan: ScanConfig,
    args: &RunArgs,
) -> Result<ExitCode> {
    let stop = StopSignal::new();
    let pacer = Pacer::new(stop.clone());

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl-C received, stopping scan");
                stop.trigger("Ctrl-C");
            }
        });
    }

    let motion = MotionController::connect(stage, motion_settings(config)?, pacer.clone()).await?;
    let timing = LaserTiming {
        warmup: config.laser.warmup()?,
        shutter_close_delay: config.laser.shutter_close_delay()?,
    };
    let laser = LaserLink::connect(transport, timing, pacer);

    let mut sequencer = ScanSequencer::new(motion, laser, stop).with_guard(guard(config));
    sequencer.validate(scan)?;

    let acknowledger: Box<dyn Acknowledger> = if args.yes {
        Box::new(AutoAcknowledge)
    } else {
        Box::new(PromptAcknowledger::terminal())
    };

    let result = sequencer.run(acknowledger.as_ref()).await;

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&sequencer.report())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    let (motion, laser) = sequencer.into_parts();
    let (_transport, closed) = laser.disconnect().await;
    if let Err(err) = closed {
        tracing::warn!(error = %err, "Laser connection did not close cleanly");
    }
    motion.disconnect();

    match result {
        Ok(report) => {
            println!(
                "✅ Scan complete: {} positions, {} bursts",
                report.positions_visited, report.shots_fired
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ ScanError::Fatal(_)) => {
            eprintln!("❌ {}", err);
            eprintln!("   Hardware may be unsafe: check the shutter, lamp and stage.");
            Ok(ExitCode::from(2))
        }
        Err(err) => {
            eprintln!("⚠️  Scan aborted: {}", err);
            Ok(ExitCode::from(1))
        }
    }
}

async fn home(path: &Path, simulate: bool) -> Result<ExitCode> {
    let config = load_config(path)?;
    logging::init(&config.logging).map_err(anyhow::Error::msg)?;

    if simulate || config.stage.driver == StageDriver::Simulated {
        home_stage(SimulatedStage::new().not_homed(), &config).await
    } else {
        home_stage(open_esp300(&config.stage)?, &config).await
    }
}

async fn home_stage<S: StageDevice>(stage: S, config: &RunConfig) -> Result<ExitCode> {
    let mut motion =
        MotionController::connect(stage, motion_settings(config)?, Pacer::default()).await?;
    println!("🏠 Homing stage...");
    motion.home().await?;
    println!(
        "✅ Stage homed at {:.2} um absolute",
        motion.status().absolute_um
    );
    motion.disconnect();
    Ok(ExitCode::SUCCESS)
}

#[cfg(feature = "instrument_serial")]
fn open_esp300(settings: &StageSettings) -> Result<Esp300Stage> {
    Ok(Esp300Stage::open(&settings.port, settings.axis)?)
}

#[cfg(not(feature = "instrument_serial"))]
fn open_esp300(_settings: &StageSettings) -> Result<Esp300Stage> {
    anyhow::bail!("ESP300 support requires the 'instrument_serial' feature")
}
