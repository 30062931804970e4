//! Controller lifecycle: orderly shutdown, stop actions, loop termination.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vacstand::config::{CryoThresholds, VacuumThresholds};
use vacstand::control::flow_loop::{FlowLoopController, FlowLoopParams};
use vacstand::cryo::{CryoHardware, CryoReservoirController, CryoTarget};
use vacstand::manifold::{ManifoldHardware, ManifoldTarget, VacuumManifoldController};
use vacstand::ports::{ProportionalValve, ProtectedGauge, Pump, Severity, Valve, ValveLimit};
use vacstand::sim::{
    MemoryAlertSink, SimGauge, SimProportionalValve, SimProtectedGauge, SimPump, SimValve,
};
use vacstand::supervisor::StopAction;

fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn stop_parks_hardware_and_issues_no_further_commands() {
    let pump = Arc::new(SimPump::running("pump"));
    let roughing = Arc::new(SimValve::new("roughing"));
    let backing = Arc::new(SimValve::new("backing"));
    let low_vacuum = Arc::new(SimValve::new("low-vacuum"));
    let high_vacuum = Arc::new(SimValve::new("high-vacuum"));
    let manifold_gauge = Arc::new(SimGauge::new("manifold", 1e-2));
    let foreline_gauge = Arc::new(SimGauge::new("foreline", 1e-2));
    let cold_cathode = Arc::new(SimProtectedGauge::new("cold-cathode", 1e-2));
    let alerts = Arc::new(MemoryAlertSink::new());

    let mut manifold = VacuumManifoldController::start(
        "manifold",
        VacuumThresholds {
            poll_interval_ms: 5,
            valve_timeout_secs: 0.2,
            ..VacuumThresholds::default()
        },
        ManifoldTarget::Evacuate,
        StopAction::TurnOff,
        ManifoldHardware {
            pump: pump.clone(),
            roughing_valve: roughing.clone(),
            backing_valve: backing.clone(),
            low_vacuum_valve: low_vacuum.clone(),
            high_vacuum_valve: high_vacuum.clone(),
            manifold_gauge: manifold_gauge.clone(),
            foreline_gauge: foreline_gauge.clone(),
            protected_gauge: Some(cold_cathode.clone()),
        },
        alerts.clone(),
    )
    .expect("controller start");

    // Let the pump-down get going before pulling the plug.
    assert!(wait_until(|| low_vacuum.is_open(), WAIT));

    manifold.stop();
    assert!(manifold.is_stopped());

    // TurnOff parked everything.
    assert!(roughing.is_closed());
    assert!(backing.is_closed());
    assert!(low_vacuum.is_closed());
    assert!(high_vacuum.is_closed());
    assert!(pump.is_off());
    assert!(!cold_cathode.is_energized());

    // No commands after the stop, even with inputs that would normally
    // provoke them.
    let commands = || {
        roughing.command_count()
            + backing.command_count()
            + low_vacuum.command_count()
            + high_vacuum.command_count()
            + pump.command_count()
    };
    let before = commands();
    manifold_gauge.set_value(760.0);
    foreline_gauge.set_value(760.0);
    thread::sleep(Duration::from_millis(80));
    assert_eq!(before, commands(), "actuator commanded after stop");
}

#[test]
fn garbage_sensor_reading_fail_stops_the_loop() {
    let pump = Arc::new(SimPump::running("pump"));
    let roughing = Arc::new(SimValve::new("roughing"));
    let backing = Arc::new(SimValve::new("backing"));
    let low_vacuum = Arc::new(SimValve::new("low-vacuum"));
    let high_vacuum = Arc::new(SimValve::new("high-vacuum"));
    let manifold_gauge = Arc::new(SimGauge::new("manifold", 1e-2));
    let foreline_gauge = Arc::new(SimGauge::new("foreline", 1e-2));
    let alerts = Arc::new(MemoryAlertSink::new());

    let mut manifold = VacuumManifoldController::start(
        "manifold",
        VacuumThresholds {
            poll_interval_ms: 5,
            valve_timeout_secs: 0.2,
            ..VacuumThresholds::default()
        },
        ManifoldTarget::Evacuate,
        StopAction::TurnOff,
        ManifoldHardware {
            pump: pump.clone(),
            roughing_valve: roughing.clone(),
            backing_valve: backing.clone(),
            low_vacuum_valve: low_vacuum.clone(),
            high_vacuum_valve: high_vacuum.clone(),
            manifold_gauge: manifold_gauge.clone(),
            foreline_gauge: foreline_gauge.clone(),
            protected_gauge: None,
        },
        alerts.clone(),
    )
    .expect("controller start");

    assert!(wait_until(|| low_vacuum.is_open(), WAIT));

    // A dead gauge head reads NaN. The loop must terminate rather than
    // keep sequencing valves on garbage, and it must leave the hardware
    // exactly as it stands (no stop action on a fail-stop).
    manifold_gauge.set_value(f64::NAN);
    assert!(wait_until(|| manifold.is_stopped(), WAIT));

    assert!(pump.is_on(), "fail-stop must not run the stop action");
    assert!(low_vacuum.is_open());
    assert!(
        alerts
            .records()
            .iter()
            .any(|r| r.severity == Severity::Fatal && r.message.contains("manifold")),
        "expected a fatal alert naming the dead gauge"
    );

    manifold.stop();
}

#[test]
fn second_stop_is_inert() {
    let bench_valve = Arc::new(SimValve::new("coolant"));
    let warmer = Arc::new(SimPump::new("warmer"));
    let thermometer = Arc::new(SimGauge::new("level", -185.0));
    let alerts = Arc::new(MemoryAlertSink::new());

    let mut reservoir = CryoReservoirController::start(
        "reservoir",
        CryoThresholds {
            poll_interval_ms: 5,
            valve_timeout_secs: 0.2,
            ..CryoThresholds::default()
        },
        CryoTarget::Freeze,
        StopAction::TurnOff,
        CryoHardware {
            coolant_valve: bench_valve.clone(),
            warmer: warmer.clone(),
            thermometer: thermometer.clone(),
        },
        Box::new(|_| {}),
        alerts.clone(),
    )
    .expect("controller start");

    assert!(wait_until(|| bench_valve.is_open(), WAIT));
    reservoir.stop();
    assert!(reservoir.is_stopped());
    assert!(bench_valve.is_closed());

    let closes = bench_valve.close_commands();
    reservoir.stop();
    assert_eq!(
        closes,
        bench_valve.close_commands(),
        "second stop re-ran the stop action"
    );
}

#[test]
fn flow_loop_terminates_at_travel_limit() {
    let valve = Arc::new(SimProportionalValve::new("leak", (0.0, 50.0)));
    let gauge = Arc::new(SimGauge::new("flow", 0.0));
    let alerts = Arc::new(MemoryAlertSink::new());

    let params = FlowLoopParams {
        gain: 5.0,
        deadband: 0.5,
        lag_secs: 0.005,
        cycle_secs: 0.01,
        min_actuator_period_secs: 0.001,
        stop_at_limit: Some(ValveLimit::FullyOpen),
        ..FlowLoopParams::default()
    };
    // Target far beyond what the plant can reach: the valve runs to its
    // open limit and the loop retires itself.
    let mut flow = FlowLoopController::start(
        "flow",
        params,
        1_000.0,
        valve.clone(),
        gauge,
        alerts.clone(),
    )
    .expect("controller start");

    assert!(wait_until(|| flow.is_stopped(), WAIT));
    assert!((valve.position() - 50.0).abs() < f64::EPSILON);
    assert!(
        alerts
            .records()
            .iter()
            .any(|r| r.severity == Severity::Info && r.message.contains("reached")),
        "expected a travel-limit alert"
    );

    let moves = valve.move_commands();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(moves, valve.move_commands(), "valve moved after loop retired");

    flow.stop();
}

#[test]
fn flow_loop_stop_joins_and_freezes_the_valve() {
    let valve = Arc::new(SimProportionalValve::new("leak", (0.0, 10_000.0)));
    let gauge = Arc::new(SimGauge::new("flow", 0.0));
    let alerts = Arc::new(MemoryAlertSink::new());

    let params = FlowLoopParams {
        gain: 0.5,
        deadband: 0.5,
        lag_secs: 0.005,
        cycle_secs: 0.01,
        min_actuator_period_secs: 0.001,
        ..FlowLoopParams::default()
    };
    let mut flow = FlowLoopController::start(
        "flow",
        params,
        500.0,
        valve.clone(),
        gauge,
        alerts,
    )
    .expect("controller start");

    assert!(wait_until(|| valve.move_commands() > 0, WAIT));
    flow.stop();
    assert!(flow.is_stopped());

    let moves = valve.move_commands();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(moves, valve.move_commands(), "valve moved after stop");
}
