//! Demo bench: a full stand assembled over simulated hardware.
//!
//! Runs a scripted session: pump the manifold down to baseline through the
//! roughing and turbo paths, freeze a cryo reservoir, converge a flow loop
//! on a first-order plant, then shut everything down in order.

#![deny(unused_must_use)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::info;

use vacstand::config::{CryoThresholds, StandConfig, VacuumThresholds};
use vacstand::control::flow_loop::{FlowLoopController, FlowLoopParams};
use vacstand::cryo::{CryoHardware, CryoReservoirController, CryoTarget};
use vacstand::manifold::{ManifoldHardware, ManifoldState, ManifoldTarget, VacuumManifoldController};
use vacstand::ports::{ConfigStore, LogAlertSink, ProportionalValve, Pump, Valve};
use vacstand::sim::{
    MemoryConfigStore, SimGauge, SimProportionalValve, SimProtectedGauge, SimPump, SimValve,
};
use vacstand::supervisor::StopAction;

const STEP: Duration = Duration::from_millis(20);

/// First-order relaxation toward a floor.
fn relax(value: f64, floor: f64, factor: f64) -> f64 {
    floor + (value - floor) * factor
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = MemoryConfigStore::default();
    let mut config: StandConfig = store.load()?;
    config.manifold = VacuumThresholds {
        poll_interval_ms: 10,
        valve_timeout_secs: 1.0,
        ..config.manifold
    };
    config.reservoir = CryoThresholds {
        poll_interval_ms: 10,
        valve_timeout_secs: 1.0,
        ..config.reservoir
    };
    store.save(&config)?;

    let alerts = Arc::new(LogAlertSink);

    // ── Manifold pump-down ────────────────────────────────────────
    let pump = Arc::new(SimPump::running("roughing-pump"));
    let roughing = Arc::new(SimValve::new("roughing"));
    let backing = Arc::new(SimValve::new("backing"));
    let low_vacuum = Arc::new(SimValve::new("low-vacuum"));
    let high_vacuum = Arc::new(SimValve::new("high-vacuum"));
    let manifold_gauge = Arc::new(SimGauge::new("manifold", 760.0));
    let foreline_gauge = Arc::new(SimGauge::new("foreline", 760.0));
    let cold_cathode = Arc::new(SimProtectedGauge::new("cold-cathode", 760.0));

    let mut manifold = VacuumManifoldController::start(
        "manifold",
        config.manifold,
        config.initial_manifold_target,
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
    )?;

    info!("pumping down to baseline");
    manifold.set_target(ManifoldTarget::Evacuate);
    let mut manifold_pressure = 760.0;
    let mut foreline_pressure = 760.0;
    for _ in 0..600 {
        let foreline_floor = if pump.is_on() && roughing.is_open() {
            1e-2
        } else {
            760.0
        };
        let manifold_floor = if high_vacuum.is_open() {
            1e-6
        } else if low_vacuum.is_open() {
            7e-4
        } else {
            manifold_pressure
        };
        // Rates are per simulated second; one step is one second.
        let next_foreline = relax(foreline_pressure, foreline_floor, 0.7);
        let next_manifold = relax(manifold_pressure, manifold_floor, 0.7);
        foreline_gauge.set(next_foreline, next_foreline - foreline_pressure);
        manifold_gauge.set(next_manifold, next_manifold - manifold_pressure);
        cold_cathode.set_value(next_manifold);
        foreline_pressure = next_foreline;
        manifold_pressure = next_manifold;

        if manifold.state() == ManifoldState::HighVacuum
            && manifold_pressure <= config.manifold.baseline_pressure
            && manifold.baseline_dwell() > Duration::from_millis(50)
        {
            break;
        }
        thread::sleep(STEP);
    }
    info!(
        "manifold settled: state {:?}, {:.2e} Torr, baseline dwell {:?}",
        manifold.state(),
        manifold_pressure,
        manifold.baseline_dwell()
    );

    // ── Reservoir freeze ──────────────────────────────────────────
    let coolant = Arc::new(SimValve::new("coolant").with_trickle());
    let warmer = Arc::new(SimPump::new("warmer"));
    let thermometer = Arc::new(SimGauge::new("level", -150.0));

    let mut reservoir = CryoReservoirController::start(
        "reservoir",
        config.reservoir,
        config.initial_reservoir_target,
        StopAction::TurnOff,
        CryoHardware {
            coolant_valve: coolant.clone(),
            warmer: warmer.clone(),
            thermometer: thermometer.clone(),
        },
        Box::new(|target| log::error!("reservoir stalled in {target:?}")),
        alerts.clone(),
    )?;

    info!("freezing reservoir");
    reservoir.set_target(CryoTarget::Freeze);
    let mut temperature: f64 = -150.0;
    for _ in 0..600 {
        let delta = if coolant.is_open() { -1.0 } else { 0.05 };
        temperature = (temperature + delta).max(-193.0);
        thermometer.set(temperature, delta);
        if temperature <= config.reservoir.frozen_temperature && coolant.is_closed() {
            break;
        }
        thread::sleep(STEP);
    }
    info!(
        "reservoir: state {:?} at {temperature:.1} °C",
        reservoir.state()
    );

    // ── Flow loop ─────────────────────────────────────────────────
    let leak_valve = Arc::new(SimProportionalValve::new("leak", (0.0, 1000.0)));
    let flow_gauge = Arc::new(SimGauge::new("flow", 0.0));
    let params = FlowLoopParams {
        gain: 2.0,
        deadband: 0.5,
        lag_secs: 0.01,
        cycle_secs: 0.02,
        min_actuator_period_secs: 0.005,
        ..FlowLoopParams::default()
    };
    let mut flow = FlowLoopController::start(
        "flow",
        params,
        50.0,
        leak_valve.clone(),
        flow_gauge.clone(),
        alerts,
    )?;

    info!("converging flow loop on target 50.0");
    let mut flow_value = 0.0;
    for _ in 0..400 {
        // First-order plant: the value relaxes toward position × 0.1.
        let equilibrium = leak_valve.position() * 0.1;
        let next = relax(flow_value, equilibrium, 0.8);
        flow_gauge.set(next, next - flow_value);
        flow_value = next;
        if (flow_value - 50.0).abs() <= 1.0 {
            break;
        }
        thread::sleep(STEP);
    }
    info!("flow loop at {flow_value:.2}");

    // ── Ordered shutdown ──────────────────────────────────────────
    info!("shutting down");
    flow.stop();
    reservoir.stop();
    manifold.stop();
    info!(
        "stopped: manifold {:?}, reservoir {:?}",
        manifold.state(),
        reservoir.state()
    );
    Ok(())
}
