//! Integration tests for the scan sequencer.
//!
//! Runs complete scans against the simulated stage and the recording laser
//! transport on a paused tokio clock, and checks ordering, abort handling
//! and the safe-state guarantees.

use pa_scan::config::{Direction, ScanConfig, ShotMode};
use pa_scan::error::{SafetyViolation, ScanError};
use pa_scan::events::ScanEventKind;
use pa_scan::hardware::{
    LaserLink, LaserTiming, MotionController, MotionSettings, RecordingTransport, SimulatedStage,
};
use pa_scan::sequencer::{AutoAcknowledge, ScanSequencer, ScanState};
use pa_scan::timing::{Pacer, StopSignal};
use std::time::Duration;

type Sequencer = ScanSequencer<SimulatedStage, RecordingTransport>;

struct Rig {
    stage: SimulatedStage,
    transport: RecordingTransport,
    stop: StopSignal,
}

impl Rig {
    fn new() -> Self {
        Self::with_stage(SimulatedStage::new())
    }

    fn with_stage(stage: SimulatedStage) -> Self {
        Self {
            stage,
            transport: RecordingTransport::new(),
            stop: StopSignal::new(),
        }
    }

    async fn sequencer(&self) -> Sequencer {
        let pacer = Pacer::new(self.stop.clone());
        let settings = MotionSettings {
            move_timeout: Duration::from_secs(2),
            ..MotionSettings::default()
        };
        let motion = MotionController::connect(self.stage.clone(), settings, pacer.clone())
            .await
            .unwrap();
        let laser = LaserLink::connect(self.transport.clone(), LaserTiming::default(), pacer);
        ScanSequencer::new(motion, laser, self.stop.clone())
    }
}

fn scan(step_count: u32, wavelengths_nm: Vec<f64>) -> ScanConfig {
    ScanConfig {
        step_count,
        step_size_um: 200.0,
        wavelengths_nm,
        settle_delay: Duration::from_millis(1200),
        inter_command_delay: Duration::from_millis(200),
        pre_scan_delay: Duration::from_secs(4),
        direction: Direction::Forward,
        max_travel_um: 8500.0,
        shot_mode: ShotMode(2),
        multishot_count: 4,
    }
}

fn moved(step: u32, position_um: f64) -> ScanEventKind {
    ScanEventKind::MovedTo { step, position_um }
}

fn wl(wavelength_nm: f64) -> ScanEventKind {
    ScanEventKind::WavelengthSet { wavelength_nm }
}

fn fire(wavelength_nm: f64) -> ScanEventKind {
    ScanEventKind::Fired { wavelength_nm }
}

/// Event kinds with positions rounded to 1e-6 um, so float noise from unit
/// conversion does not break equality.
fn kinds(seq: &Sequencer) -> Vec<ScanEventKind> {
    seq.events()
        .kinds()
        .into_iter()
        .map(|kind| match kind {
            ScanEventKind::MovedTo { step, position_um } => ScanEventKind::MovedTo {
                step,
                position_um: (position_um * 1e6).round() / 1e6,
            },
            ScanEventKind::ReturnedHome { position_um } => ScanEventKind::ReturnedHome {
                position_um: (position_um * 1e6).round() / 1e6,
            },
            other => other,
        })
        .collect()
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scan_order_is_position_major_wavelength_minor() {
    let rig = Rig::new();
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0, 530.0])).unwrap();

    let report = seq.run(&AutoAcknowledge).await.unwrap();

    let mut expected = vec![ScanEventKind::Started, ScanEventKind::Armed];
    for (step, position) in [0.0, 200.0, 400.0, 600.0].into_iter().enumerate() {
        expected.push(moved(step as u32, position));
        expected.extend([wl(430.0), fire(430.0), wl(530.0), fire(530.0)]);
    }
    expected.extend([
        ScanEventKind::Disarmed,
        ScanEventKind::ReturnedHome { position_um: 0.0 },
        ScanEventKind::Completed,
    ]);

    assert_eq!(kinds(&seq), expected);
    assert_eq!(report.final_state, ScanState::Complete);
    assert_eq!(report.positions_visited, 4);
    assert_eq!(report.shots_fired, 8);
}

#[tokio::test(start_paused = true)]
async fn test_laser_wire_sequence() {
    let rig = Rig::new();
    let mut seq = rig.sequencer().await;
    seq.validate(scan(2, vec![430.0, 530.0])).unwrap();
    seq.run(&AutoAcknowledge).await.unwrap();

    assert_eq!(
        rig.transport.commands(),
        vec![
            "SET_WAVELENGTH=430",
            "SET_POCKELSCELL_SHOT_MODE=2",
            "SET_MULTISHOT_COUNT=4",
            "FLASHLAMP_ON",
            "SET_SHUTTER_STATE=OPEN",
            "SET_WAVELENGTH=430",
            "START_MULTISHOT",
            "SET_WAVELENGTH=530",
            "START_MULTISHOT",
            "SET_WAVELENGTH=430",
            "START_MULTISHOT",
            "SET_WAVELENGTH=530",
            "START_MULTISHOT",
            "SET_SHUTTER_STATE=CLOSE",
            "FLASHLAMP_OFF",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backward_scan_moves_to_negative_offsets() {
    let rig = Rig::with_stage(SimulatedStage::new().with_position_um(7_000.0));
    let mut seq = rig.sequencer().await;
    let mut config = scan(4, vec![430.0]);
    config.direction = Direction::Backward;
    seq.validate(config).unwrap();
    seq.run(&AutoAcknowledge).await.unwrap();

    let positions: Vec<f64> = kinds(&seq)
        .into_iter()
        .filter_map(|k| match k {
            ScanEventKind::MovedTo { position_um, .. } => Some(position_um),
            _ => None,
        })
        .collect();
    assert_eq!(positions, vec![0.0, -200.0, -400.0, -600.0]);
    assert!((rig.stage.position_um() - 7_000.0).abs() < 1e-6);
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rejected_configs_make_no_device_calls() {
    let too_far = {
        let mut c = scan(44, vec![430.0]);
        c.step_size_um = 200.0;
        c
    };
    let rejected = vec![
        scan(3, vec![430.0]),
        scan(0, vec![430.0]),
        too_far,
        scan(4, vec![]),
        scan(4, vec![430.0, 0.0]),
    ];

    for config in rejected {
        let rig = Rig::new();
        let mut seq = rig.sequencer().await;
        let err = seq.validate(config).unwrap_err();
        assert!(matches!(err, ScanError::Safety(_)), "unexpected: {err}");
        assert!(seq.run(&AutoAcknowledge).await.is_err());

        assert_eq!(rig.stage.calls().moves, 0);
        assert_eq!(rig.stage.calls().homes, 0);
        assert_eq!(rig.transport.attempts(), 0);
        assert_eq!(seq.state(), &ScanState::Idle);
    }
}

// =============================================================================
// Abort paths
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_arm_failure_aborts_and_cleans_up_once() {
    let rig = Rig::new();
    rig.transport.fail_on("FLASHLAMP_ON");
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0])).unwrap();

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();

    assert!(matches!(err, ScanError::DeviceIo { .. }), "unexpected: {err}");
    assert!(matches!(seq.state(), ScanState::Aborted(_)));
    let log = seq.events();
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::Disarmed)), 1);
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::ReturnedHome { .. })), 1);
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::MovedTo { .. })), 0);
    assert_eq!(rig.transport.count("SET_SHUTTER_STATE=CLOSE"), 1);
    assert_eq!(rig.transport.count("FLASHLAMP_OFF"), 1);
    assert_eq!(rig.transport.count("START_MULTISHOT"), 0);
    // start-of-scan move to origin, then the safe-state return home
    assert_eq!(rig.stage.calls().moves, 2);
}

#[tokio::test(start_paused = true)]
async fn test_laser_failure_mid_scan_is_not_retried() {
    let rig = Rig::new();
    rig.transport.fail_once("SET_WAVELENGTH=530");
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0, 530.0])).unwrap();

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();

    assert!(matches!(err, ScanError::DeviceIo { .. }));
    assert_eq!(rig.transport.count("START_MULTISHOT"), 1);
    assert_eq!(rig.transport.count("SET_WAVELENGTH=530"), 0);
    assert_eq!(
        seq.events().count(|k| matches!(k, ScanEventKind::MovedTo { .. })),
        1
    );
    let tail: Vec<_> = kinds(&seq).into_iter().rev().take(3).collect();
    assert_eq!(
        tail,
        vec![
            ScanEventKind::ReturnedHome { position_um: 0.0 },
            ScanEventKind::Disarmed,
            ScanEventKind::Aborted {
                reason: err.to_string()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_move_timeout_is_retried_once() {
    let rig = Rig::new();
    // move 0 is the start-of-scan move to origin, move 1 is step 0
    rig.stage.stall_moves(1, 1);
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0])).unwrap();

    let report = seq.run(&AutoAcknowledge).await.unwrap();

    assert_eq!(report.final_state, ScanState::Complete);
    assert_eq!(report.positions_visited, 4);
    assert_eq!(report.shots_fired, 4);
    // 1 start + 4 steps + 1 retry + 1 final return
    assert_eq!(rig.stage.calls().moves, 7);
}

#[tokio::test(start_paused = true)]
async fn test_second_move_timeout_aborts() {
    let rig = Rig::new();
    rig.stage.stall_moves(1, 2);
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0])).unwrap();

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();

    assert!(err.is_recoverable(), "unexpected: {err}");
    assert!(matches!(seq.state(), ScanState::Aborted(_)));
    assert_eq!(rig.transport.count("START_MULTISHOT"), 0);
    assert_eq!(rig.transport.count("FLASHLAMP_OFF"), 1);
    assert_eq!(
        seq.events()
            .count(|k| matches!(k, ScanEventKind::ReturnedHome { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_request_still_disarms_and_returns_home() {
    let rig = Rig::with_stage(SimulatedStage::new().with_move_duration(Duration::from_millis(400)));
    let mut seq = rig.sequencer().await;
    seq.validate(scan(30, vec![430.0, 530.0, 630.0])).unwrap();

    let stop = rig.stop.clone();
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        stop.trigger("operator abort");
    });

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();
    trigger.await.unwrap();

    assert!(matches!(err, ScanError::Cancelled(ref r) if r == "operator abort"));
    assert!(matches!(seq.state(), ScanState::Aborted(_)));
    let log = seq.events();
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::Disarmed)), 1);
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::ReturnedHome { .. })), 1);
    assert!(log.count(|k| matches!(k, ScanEventKind::MovedTo { .. })) < 30);

    let (motion, laser) = seq.into_parts();
    assert!(laser.state().is_safe());
    assert!(motion.current_position().await.unwrap().um().abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_run_never_powers_the_laser() {
    let rig = Rig::new();
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0])).unwrap();
    rig.stop.trigger("ctrl-c during prompt");

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();

    assert!(matches!(err, ScanError::Cancelled(ref r) if r == "ctrl-c during prompt"));
    assert!(matches!(seq.state(), ScanState::Aborted(_)));
    assert_eq!(rig.transport.count("SET_WAVELENGTH"), 0);
    assert_eq!(rig.transport.count("FLASHLAMP_ON"), 0);
    assert_eq!(
        rig.transport.commands(),
        vec!["SET_SHUTTER_STATE=CLOSE", "FLASHLAMP_OFF"]
    );
    // only the safe-state return to origin
    assert_eq!(rig.stage.calls().moves, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_move_skips_arming() {
    let rig = Rig::with_stage(SimulatedStage::new().with_move_duration(Duration::from_secs(1)));
    let mut seq = rig.sequencer().await;
    seq.validate(scan(4, vec![430.0])).unwrap();

    let stop = rig.stop.clone();
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.trigger("operator abort");
    });

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();
    trigger.await.unwrap();

    assert!(matches!(err, ScanError::Cancelled(_)), "unexpected: {err}");
    assert_eq!(rig.transport.count("FLASHLAMP_ON"), 0);
    assert_eq!(rig.transport.count("SET_WAVELENGTH"), 0);
    let log = seq.events();
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::Armed)), 0);
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::ReturnedHome { .. })), 1);
}

// =============================================================================
// Fatal paths
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_disarm_is_fatal_but_stage_still_returns() {
    let rig = Rig::new();
    rig.transport.fail_on("FLASHLAMP_OFF");
    let mut seq = rig.sequencer().await;
    seq.validate(scan(2, vec![430.0])).unwrap();

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();

    assert!(err.is_fatal(), "unexpected: {err}");
    assert!(matches!(seq.state(), ScanState::Aborted(_)));
    let log = seq.events();
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::Disarmed)), 0);
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::ReturnedHome { .. })), 1);
    assert_eq!(log.count(|k| matches!(k, ScanEventKind::Completed)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stage_failure_before_arming_never_fires() {
    let rig = Rig::new();
    rig.stage.fail_moves(true);
    let mut seq = rig.sequencer().await;
    seq.validate(scan(2, vec![430.0])).unwrap();

    let err = seq.run(&AutoAcknowledge).await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(rig.transport.count("FLASHLAMP_ON"), 0);
    assert_eq!(rig.transport.count("START_MULTISHOT"), 0);
    // laser state was never confirmed, so both safe-state commands go out
    assert_eq!(
        rig.transport.commands(),
        vec!["SET_SHUTTER_STATE=CLOSE", "FLASHLAMP_OFF"]
    );
}

// =============================================================================
// Acknowledgments
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_high_wavelength_requires_acknowledgment() {
    let rig = Rig::new();
    let mut seq = rig.sequencer().await;
    seq.validate(scan(2, vec![430.0, 630.0])).unwrap();

    let err = seq
        .run(&pa_scan::sequencer::DenyAll)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ScanError::Safety(SafetyViolation::Unacknowledged(ref msg)) if msg.contains("630")
    ));
    assert_eq!(rig.transport.attempts(), 0);
    assert_eq!(rig.stage.calls().moves, 0);

    let report = seq.run(&AutoAcknowledge).await.unwrap();
    assert_eq!(report.shots_fired, 4);
}
