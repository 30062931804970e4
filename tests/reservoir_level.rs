//! Reservoir level control over simulated bench hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use vacstand::config::{CryoThresholds, HeaterConfig};
use vacstand::cryo::heated::{HeatedReservoirController, HeatedTarget, HeaterState};
use vacstand::cryo::{CryoHardware, CryoReservoirController, CryoTarget, ReservoirState};
use vacstand::ports::{Pump, Valve};
use vacstand::sim::{MemoryAlertSink, SimGauge, SimPump, SimValve};
use vacstand::supervisor::StopAction;

fn fast_thresholds() -> CryoThresholds {
    CryoThresholds {
        poll_interval_ms: 5,
        valve_timeout_secs: 0.2,
        ..CryoThresholds::default()
    }
}

struct Bench {
    coolant: Arc<SimValve>,
    warmer: Arc<SimPump>,
    thermometer: Arc<SimGauge>,
    alerts: Arc<MemoryAlertSink>,
}

impl Bench {
    fn new(temperature: f64) -> Self {
        Self {
            coolant: Arc::new(SimValve::new("coolant").with_trickle()),
            warmer: Arc::new(SimPump::new("warmer")),
            thermometer: Arc::new(SimGauge::new("level", temperature)),
            alerts: Arc::new(MemoryAlertSink::new()),
        }
    }

    fn hardware(&self) -> CryoHardware {
        CryoHardware {
            coolant_valve: self.coolant.clone(),
            warmer: self.warmer.clone(),
            thermometer: self.thermometer.clone(),
        }
    }

    fn controller(
        &self,
        thresholds: CryoThresholds,
        initial: CryoTarget,
    ) -> CryoReservoirController {
        CryoReservoirController::start(
            "reservoir",
            thresholds,
            initial,
            StopAction::TurnOff,
            self.hardware(),
            Box::new(|_| {}),
            self.alerts.clone(),
        )
        .expect("controller start")
    }
}

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
fn freeze_opens_at_loose_trigger_and_closes_at_level() {
    let bench = Bench::new(-188.0); // sagged 4°, inside the loose margin
    let mut controller = bench.controller(fast_thresholds(), CryoTarget::Freeze);

    // 4° of sag is not enough for Freeze.
    thread::sleep(Duration::from_millis(60));
    assert!(bench.coolant.is_closed());
    assert_eq!(controller.state(), ReservoirState::Holding);

    // At the loose trigger the fill starts.
    bench.thermometer.set(-187.0, 0.0);
    assert!(wait_until(|| bench.coolant.is_open(), WAIT));
    assert_eq!(controller.state(), ReservoirState::Filling);

    // At the frozen threshold it closes fully (no trickle in Freeze).
    bench.thermometer.set(-192.0, -0.1);
    assert!(wait_until(|| bench.coolant.is_closed(), WAIT));
    assert!(!bench.coolant.is_trickling());
    assert_eq!(controller.state(), ReservoirState::AtLevel);

    controller.stop();
}

#[test]
fn raise_uses_tight_trigger_and_trickles_at_level() {
    let bench = Bench::new(-190.5);
    let mut controller = bench.controller(fast_thresholds(), CryoTarget::Raise);

    // Half a degree inside the tight margin: holding.
    thread::sleep(Duration::from_millis(60));
    assert!(bench.coolant.is_closed());

    bench.thermometer.set(-190.0, 0.0);
    assert!(wait_until(|| bench.coolant.is_open(), WAIT));

    // At level the valve drops to its trickle opening instead of closing.
    bench.thermometer.set(-192.0, -0.1);
    assert!(wait_until(|| bench.coolant.is_trickling(), WAIT));
    assert!(bench.coolant.is_open());
    assert_eq!(controller.state(), ReservoirState::AtLevel);

    controller.stop();
}

#[test]
fn continuous_open_cap_cycles_the_valve() {
    let bench = Bench::new(-185.0); // far below level, fill runs long
    let thresholds = CryoThresholds {
        max_open_secs: 0.05,
        ..fast_thresholds()
    };
    let mut controller = bench.controller(thresholds, CryoTarget::Freeze);

    assert!(wait_until(|| bench.coolant.is_open(), WAIT));
    // The cap forces a close, and the still-low level forces a reopen.
    assert!(wait_until(|| bench.coolant.close_commands() >= 1, WAIT));
    assert!(wait_until(|| bench.coolant.open_commands() >= 2, WAIT));

    controller.stop();
}

#[test]
fn adopts_an_already_open_valve_and_applies_the_cap() {
    // A restart may find the coolant valve open with no record of when it
    // opened. The loop adopts it (no redundant open command) and the
    // continuous-open cap starts counting from adoption.
    let bench = Bench::new(-170.0);
    bench.coolant.force(true);
    let thresholds = CryoThresholds {
        max_open_secs: 0.05,
        ..fast_thresholds()
    };
    let mut controller = bench.controller(thresholds, CryoTarget::Freeze);

    // Well inside the 50 ms cap: the valve stands open with no command
    // issued for it.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(bench.coolant.open_commands(), 0, "adopted opening was re-commanded");

    // The cap then cycles the seat and the still-low level reopens.
    assert!(wait_until(|| bench.coolant.close_commands() >= 1, WAIT));
    assert!(wait_until(|| bench.coolant.open_commands() >= 1, WAIT));

    controller.stop();
}

#[test]
fn thaw_returns_to_standby_when_warm() {
    let bench = Bench::new(-150.0);
    let mut controller = bench.controller(fast_thresholds(), CryoTarget::Standby);

    controller.set_target(CryoTarget::Thaw);
    assert!(wait_until(|| bench.warmer.is_on(), WAIT));
    assert_eq!(controller.state(), ReservoirState::Thawing);

    bench.thermometer.set(12.0, 0.1);
    assert!(wait_until(|| controller.target() == CryoTarget::Standby, WAIT));
    assert!(bench.warmer.is_off());

    controller.stop();
}

#[test]
fn stalled_fill_escalates_once_per_period() {
    let bench = Bench::new(-185.0);
    let fired = Arc::new(AtomicU32::new(0));
    let fired_cb = fired.clone();
    let thresholds = CryoThresholds {
        max_minutes_to_freeze: 0.2 / 60.0, // 200 ms
        ..fast_thresholds()
    };
    let mut controller = CryoReservoirController::start(
        "reservoir",
        thresholds,
        CryoTarget::Freeze,
        StopAction::TurnOff,
        bench.hardware(),
        Box::new(move |_| {
            fired_cb.fetch_add(1, Ordering::Relaxed);
        }),
        bench.alerts.clone(),
    )
    .expect("controller start");

    // The valve opens, but the temperature never falls: a stall. With a
    // 200 ms limit, exactly one escalation lands inside a 300 ms window
    // even though dozens of ticks run.
    assert!(wait_until(|| fired.load(Ordering::Relaxed) >= 1, WAIT));
    let after_first = Instant::now();
    thread::sleep(Duration::from_millis(80));
    assert_eq!(
        fired.load(Ordering::Relaxed),
        1,
        "escalation flooded within {:?} of the first firing",
        after_first.elapsed()
    );

    controller.stop();
}

#[test]
fn heater_regulates_only_while_cooling_is_safe() {
    let bench = Bench::new(-192.5); // at level, coolant stays closed
    let heater = Arc::new(SimPump::new("heater"));
    let regulation = Arc::new(SimGauge::new("trap", -85.0));
    let safety = Arc::new(SimGauge::new("safety", 20.0));

    let mut controller = HeatedReservoirController::start(
        "trap",
        fast_thresholds(),
        HeaterConfig::default(), // hold -80, band 2, safety limit 60
        HeatedTarget::Regulate,
        StopAction::TurnOff,
        bench.hardware(),
        heater.clone(),
        regulation.clone(),
        safety.clone(),
        Box::new(|_| {}),
        bench.alerts.clone(),
    )
    .expect("controller start");

    // Cold trap, safe cooling: heater comes on.
    assert!(wait_until(|| heater.is_on(), WAIT));
    assert_eq!(controller.heater_state(), HeaterState::Heating);

    // Above the band: heater holds off.
    regulation.set_value(-77.0);
    assert!(wait_until(|| heater.is_off(), WAIT));
    assert_eq!(controller.heater_state(), HeaterState::Holding);

    // Level sags below the trigger: the fill opens the coolant valve and
    // the heater must stay off while it does.
    regulation.set_value(-85.0);
    bench.thermometer.set(-186.0, 0.0);
    assert!(wait_until(|| bench.coolant.is_open(), WAIT));
    thread::sleep(Duration::from_millis(60));
    assert!(heater.is_off());
    assert_eq!(controller.heater_state(), HeaterState::Off);

    controller.stop();
}

#[test]
fn safety_thermometer_locks_the_heater_out() {
    let bench = Bench::new(-192.5);
    let heater = Arc::new(SimPump::new("heater"));
    let regulation = Arc::new(SimGauge::new("trap", -85.0));
    let safety = Arc::new(SimGauge::new("safety", 20.0));

    let mut controller = HeatedReservoirController::start(
        "trap",
        fast_thresholds(),
        HeaterConfig::default(),
        HeatedTarget::Regulate,
        StopAction::TurnOff,
        bench.hardware(),
        heater.clone(),
        regulation.clone(),
        safety.clone(),
        Box::new(|_| {}),
        bench.alerts.clone(),
    )
    .expect("controller start");

    assert!(wait_until(|| heater.is_on(), WAIT));

    safety.set_value(65.0);
    assert!(wait_until(|| heater.is_off(), WAIT));
    assert_eq!(controller.heater_state(), HeaterState::Lockout);

    // Still cold at the regulation point, but locked out.
    thread::sleep(Duration::from_millis(60));
    assert!(heater.is_off());

    safety.set_value(30.0);
    assert!(wait_until(|| heater.is_on(), WAIT));
    assert_eq!(controller.heater_state(), HeaterState::Heating);

    controller.stop();
}
