//! Ramp test behavior against the simulated bench.

mod common;

use common::{connected_bench, wait_for};
use hv_daq::bridge::SessionKind;
use hv_daq::controller::StabilizationController;
use hv_daq::instrument::OutputChannel;
use hv_daq::params::{
    CycleMode, StabilizationParameters, TestParameters, DEFAULT_REST_VOLTAGE,
};
use hv_daq::sequencer::{SequencerPhase, TestSequencer};
use hv_daq::DaqError;
use std::time::Duration;

fn ramp(start: f64, target: f64, step: f64, delay: f64) -> TestParameters {
    TestParameters {
        start_voltage: start,
        target_voltage: target,
        voltage_step: step,
        step_delay: delay,
        cycle_time: 0.0,
        rest_voltage: None,
        ..TestParameters::default()
    }
}

#[tokio::test]
async fn single_pass_reaches_target_in_exact_ticks() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);

    sequencer.start(ramp(0.0, 100.0, 10.0, 0.0)).await.unwrap();
    let state = wait_for(&bridge, "ramp to finish", |s| {
        s.sequencer.phase == SequencerPhase::Stopped && s.claims.is_empty()
    })
    .await;

    assert_eq!(state.sequencer.step_count, 10);
    assert_eq!(state.sequencer.setpoint, Some(100.0));
    assert_eq!(state.sequencer.last_result.as_deref(), Some("completed"));

    let history = bench.hv_source.history().await;
    assert_eq!(history.len(), 11);
    assert!(history.iter().all(|v| *v <= 100.0));
    assert_eq!(history.last(), Some(&100.0));
}

#[tokio::test]
async fn uneven_step_is_clamped_to_target() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);

    sequencer.start(ramp(100.0, 0.0, -30.0, 0.0)).await.unwrap();
    wait_for(&bridge, "ramp to finish", |s| {
        s.sequencer.phase == SequencerPhase::Stopped
    })
    .await;
    assert_eq!(bench.hv_source.history().await, vec![100.0, 70.0, 40.0, 10.0, 0.0]);
}

#[tokio::test]
async fn completed_pass_parks_at_default_rest_voltage() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);
    let params = TestParameters {
        rest_voltage: TestParameters::default().rest_voltage,
        ..ramp(0.0, 30.0, 10.0, 0.0)
    };
    assert_eq!(params.rest_voltage, Some(DEFAULT_REST_VOLTAGE));

    sequencer.start(params).await.unwrap();
    let state = wait_for(&bridge, "ramp to finish", |s| {
        s.sequencer.phase == SequencerPhase::Stopped && s.claims.is_empty()
    })
    .await;
    assert_eq!(state.sequencer.step_count, 3);
    assert_eq!(state.sequencer.setpoint, Some(DEFAULT_REST_VOLTAGE));
    assert_eq!(
        bench.hv_source.history().await,
        vec![0.0, 10.0, 20.0, 30.0, DEFAULT_REST_VOLTAGE]
    );
}

#[tokio::test]
async fn invalid_parameters_issue_no_commands() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);
    let before = bridge.read();

    for params in [
        ramp(0.0, 100.0, 0.0, 0.0),
        ramp(0.0, 100.0, -10.0, 0.0),
        ramp(50.0, 50.0, 10.0, 0.0),
        ramp(0.0, f64::NAN, 10.0, 0.0),
        ramp(0.0, 100.0, 10.0, -1.0),
    ] {
        let err = sequencer.start(params).await.unwrap_err();
        assert!(matches!(err, DaqError::ConfigInvalid(_)), "{:?}", err);
    }

    let after = bridge.read();
    assert_eq!(after.commands_executed, before.commands_executed);
    assert_eq!(after.sequencer.phase, SequencerPhase::Idle);
    assert!(bench.hv_source.history().await.is_empty());
}

#[tokio::test]
async fn device_error_faults_once_and_halts() {
    let (bench, bridge) = connected_bench().await;
    bench.hv_source.fail_after_sets(3);
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);

    sequencer.start(ramp(0.0, 100.0, 10.0, 0.0)).await.unwrap();
    let state = wait_for(&bridge, "fault and release", |s| {
        s.sequencer.phase == SequencerPhase::Faulted && s.claims.is_empty()
    })
    .await;
    assert_eq!(state.sequencer.step_count, 2);
    assert!(state.sequencer.fault.is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = bridge.read();
    assert_eq!(later.sequencer.phase, SequencerPhase::Faulted);
    assert_eq!(later.sequencer.step_count, 2);
    assert_eq!(bench.hv_source.history().await, vec![0.0, 10.0, 20.0]);

    let stopped = sequencer.stop().await.unwrap();
    assert_eq!(stopped.phase, SequencerPhase::Stopped);
    assert_eq!(stopped.fault, None);
}

#[tokio::test(start_paused = true)]
async fn stop_leaves_output_at_last_setpoint() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);

    sequencer.start(ramp(0.0, 1000.0, 10.0, 1.0)).await.unwrap();
    wait_for(&bridge, "two ticks", |s| s.sequencer.step_count >= 2).await;
    let stopped = sequencer.stop().await.unwrap();

    assert_eq!(stopped.phase, SequencerPhase::Stopped);
    assert_eq!(stopped.last_result.as_deref(), Some("stopped"));
    let history = bench.hv_source.history().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(bench.hv_source.history().await, history);
    assert_eq!(bench.hv_source.voltage().await, stopped.setpoint.unwrap());
    assert!(bridge.read().claims.is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_cycles_return_to_start_with_rest_voltage() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);
    let params = TestParameters {
        cycle_time: 5.0,
        cycle_mode: CycleMode::Restart,
        rest_voltage: Some(5.0),
        ..ramp(0.0, 30.0, 10.0, 0.5)
    };

    sequencer.start(params).await.unwrap();
    wait_for(&bridge, "third cycle", |s| s.sequencer.cycle >= 3).await;
    sequencer.stop().await.unwrap();

    let history = bench.hv_source.history().await;
    assert_eq!(
        history[..10],
        [0.0, 10.0, 20.0, 30.0, 5.0, 0.0, 10.0, 20.0, 30.0, 5.0]
    );
}

#[tokio::test(start_paused = true)]
async fn reverse_cycles_alternate_direction() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);
    let params = TestParameters {
        cycle_time: 5.0,
        cycle_mode: CycleMode::Reverse,
        ..ramp(0.0, 30.0, 10.0, 0.5)
    };

    sequencer.start(params).await.unwrap();
    let state = wait_for(&bridge, "third cycle", |s| s.sequencer.cycle >= 3).await;
    assert_eq!(state.sequencer.pass_target, Some(30.0));
    sequencer.stop().await.unwrap();

    let history = bench.hv_source.history().await;
    assert_eq!(history[..8], [0.0, 10.0, 20.0, 30.0, 30.0, 20.0, 10.0, 0.0]);
}

#[tokio::test(start_paused = true)]
async fn second_ramp_conflicts_and_leaves_first_running() {
    let (_bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);

    sequencer.start(ramp(0.0, 1000.0, 10.0, 1.0)).await.unwrap();
    let err = sequencer.start(ramp(0.0, 50.0, 5.0, 0.0)).await.unwrap_err();
    assert!(matches!(err, DaqError::Conflict(_)));

    let state = bridge.read();
    assert_eq!(state.sequencer.phase, SequencerPhase::Ramping);
    assert_eq!(state.sequencer.pass_target, Some(1000.0));
    sequencer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sequencer_and_controller_exclude_each_other() {
    let (_bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 100.0);
    let controller = StabilizationController::new(bridge.clone());

    sequencer.start(ramp(0.0, 1000.0, 10.0, 1.0)).await.unwrap();
    let before = bridge.read();
    let err = controller
        .start(StabilizationParameters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Conflict(_)));
    let after = bridge.read();
    assert_eq!(after.controller, before.controller);
    assert_eq!(
        after.claims.get(&OutputChannel::HvSource),
        Some(&SessionKind::Sequencer)
    );
    sequencer.stop().await.unwrap();

    controller
        .start(StabilizationParameters::default())
        .await
        .unwrap();
    let before = bridge.read();
    let err = sequencer.start(ramp(0.0, 100.0, 10.0, 0.0)).await.unwrap_err();
    assert!(matches!(err, DaqError::Conflict(_)));
    assert_eq!(bridge.read().sequencer, before.sequencer);
    controller.stop().await.unwrap();
}

#[tokio::test]
async fn reset_voltage_applies_safe_voltage_in_any_state() {
    let (bench, bridge) = connected_bench().await;
    let sequencer = TestSequencer::new(bridge.clone(), 123.0);
    sequencer.reset_voltage().await.unwrap();
    assert_eq!(bench.hv_source.voltage().await, 123.0);
    assert_eq!(bridge.read().sequencer.phase, SequencerPhase::Idle);
}
