//! Cryogenic reservoir level control.
//!
//! A reservoir's fill level is sensed indirectly: a thermometer at the
//! overflow point reads near `frozen_temperature` when coolant covers it
//! and drifts warmer as the level drops. The controller tops the reservoir
//! up by opening a coolant-supply valve, with two maintenance styles and a
//! warm-up mode:
//!
//! - **Freeze** is a minimal fill: top up only when the level has sagged
//!   by the loose `freeze_trigger` margin.
//! - **Raise** is a maximal fill: top up at the tight `raise_trigger`
//!   margin, and at level switch the valve to a reduced sustained trickle
//!   (when supported) so a small overflow keeps the sensor covered.
//! - **Thaw** runs the warming actuator until the reservoir reaches
//!   `thaw_temperature`, then hands the target back to Standby.
//!
//! A continuous-open cap on the coolant valve forces a close/reopen cycle
//! so the seat never sticks; a trickling valve is exempt, that mode exists
//! for sustained operation.
//!
//! A fill that makes no progress within `max_minutes_to_freeze` fires an
//! injected escalation callback. Collapsing sibling reservoirs to Standby
//! on a shared-supply failure is the caller's business, wired through that
//! callback.

pub mod heated;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::CryoThresholds;
use crate::error::{Error, Result};
use crate::ports::{AlertSink, Gauge, Pump, Severity, Valve};
use crate::supervisor::{Program, StopAction, Supervisor, Tick};

// ───────────────────────────────────────────────────────────────
// Target and observed state
// ───────────────────────────────────────────────────────────────

/// Desired reservoir mode, set externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryoTarget {
    /// Manage nothing; coolant closed, warmer off.
    Standby,
    /// Warm the reservoir to near-ambient, then return to Standby.
    Thaw,
    /// Minimal-fill maintenance (loose trigger).
    Freeze,
    /// Maximal-fill maintenance (tight trigger, trickle at level).
    Raise,
}

/// Reservoir condition derived purely from target, level temperature, and
/// the coolant valve flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservoirState {
    Standby,
    /// Level has sagged past the active trigger margin.
    BelowLevel,
    /// Coolant valve passing, level coming up.
    Filling,
    /// Inside the trigger margin with the valve closed.
    Holding,
    /// Level sensor at/below the frozen threshold.
    AtLevel,
    Thawing,
    Thawed,
}

/// Pure derivation: (target, snapshot) in, state out.
#[must_use]
pub fn derive_state(
    target: CryoTarget,
    temperature: f64,
    coolant_open: bool,
    t: &CryoThresholds,
) -> ReservoirState {
    match target {
        CryoTarget::Standby => ReservoirState::Standby,
        CryoTarget::Thaw => {
            if temperature >= t.thaw_temperature {
                ReservoirState::Thawed
            } else {
                ReservoirState::Thawing
            }
        }
        CryoTarget::Freeze | CryoTarget::Raise => {
            let trigger = match target {
                CryoTarget::Raise => t.raise_trigger,
                _ => t.freeze_trigger,
            };
            if temperature <= t.frozen_temperature {
                ReservoirState::AtLevel
            } else if coolant_open {
                ReservoirState::Filling
            } else if temperature >= t.frozen_temperature + trigger {
                ReservoirState::BelowLevel
            } else {
                ReservoirState::Holding
            }
        }
    }
}

/// Fill decision for one trigger margin. `Some(open?)` commands a change,
/// `None` leaves the valve alone.
fn fill_decision(coolant_open: bool, temperature: f64, trigger: f64, t: &CryoThresholds) -> Option<bool> {
    if !coolant_open && temperature >= t.frozen_temperature + trigger {
        Some(true)
    } else if coolant_open && temperature <= t.frozen_temperature {
        Some(false)
    } else {
        None
    }
}

// ───────────────────────────────────────────────────────────────
// Hardware bundle
// ───────────────────────────────────────────────────────────────

/// The device-layer handles one reservoir controller commands and observes.
#[derive(Clone)]
pub struct CryoHardware {
    pub coolant_valve: Arc<dyn Valve>,
    /// Warming actuator for Thaw (heater tape, warm-gas circuit).
    pub warmer: Arc<dyn Pump>,
    /// Level thermometer at the overflow point.
    pub thermometer: Arc<dyn Gauge>,
}

/// Escalation callback fired when a fill stalls. The callback may command
/// sibling reservoirs; this controller never reaches outside itself.
pub type StallEscalation = Box<dyn Fn(CryoTarget) + Send>;

// ───────────────────────────────────────────────────────────────
// Control program
// ───────────────────────────────────────────────────────────────

struct CryoProgram {
    name: String,
    hw: CryoHardware,
    thresholds: Arc<Mutex<CryoThresholds>>,
    escalation: StallEscalation,
    alerts: Arc<dyn AlertSink>,
    /// When the current continuous full-open began.
    opened_at: Option<Instant>,
    /// The valve is in its reduced sustained opening.
    trickling: bool,
}

impl CryoProgram {
    fn thresholds(&self) -> CryoThresholds {
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn command_valve(&mut self, open: bool, timeout: Duration) -> Tick<CryoTarget> {
        let valve = &self.hw.coolant_valve;
        let confirmed = if open {
            info!("{}: opening '{}'", self.name, valve.name());
            valve.open_wait(timeout)
        } else {
            info!("{}: closing '{}'", self.name, valve.name());
            valve.close_wait(timeout)
        };
        if !confirmed {
            warn!("{}: '{}' did not confirm in time", self.name, valve.name());
            self.alerts.raise(
                Severity::Warning,
                &self.name,
                &format!(
                    "coolant valve '{}' did not confirm {} in time",
                    valve.name(),
                    if open { "open" } else { "closed" }
                ),
            );
        }
        self.opened_at = open.then(Instant::now);
        self.trickling = false;
        Tick::Progress
    }

    /// One fill-maintenance tick for the given trigger margin.
    fn fill_tick(&mut self, trigger: f64, trickle_at_level: bool) -> Tick<CryoTarget> {
        let t = self.thresholds();
        let timeout = Duration::from_secs_f32(t.valve_timeout_secs);
        let temperature = self.hw.thermometer.value();
        let open = self.hw.coolant_valve.is_open();

        if self.hw.warmer.is_on() {
            info!("{}: stopping warmer before filling", self.name);
            self.hw.warmer.turn_off();
            return Tick::Progress;
        }

        // Trickling inside the margin: stay put, that is the goal state.
        if open && self.trickling && temperature < t.frozen_temperature + trigger {
            return Tick::Converged;
        }

        match fill_decision(open && !self.trickling, temperature, trigger, &t) {
            Some(true) => return self.command_valve(true, timeout),
            Some(false) => {
                if trickle_at_level && self.hw.coolant_valve.supports_trickle() {
                    info!("{}: at level, switching to trickle", self.name);
                    self.hw.coolant_valve.trickle();
                    self.opened_at = None;
                    self.trickling = true;
                    return Tick::Progress;
                }
                return self.command_valve(false, timeout);
            }
            None => {}
        }

        // Continuous-open cap: cycle the seat. The reopen happens naturally
        // on a later tick while the level remains low.
        if open && !self.trickling {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= Duration::from_secs_f32(t.max_open_secs) {
                    info!("{}: continuous-open cap reached, cycling valve", self.name);
                    return self.command_valve(false, timeout);
                }
            } else {
                // Found open with no record (first tick after restart).
                self.opened_at = Some(Instant::now());
            }
        }

        if open {
            // Filling; falling temperature is forward progress.
            if self.hw.thermometer.is_falling(t.falling_band) {
                Tick::Progress
            } else {
                Tick::Pending
            }
        } else {
            // Closed inside the margin: holding.
            Tick::Converged
        }
    }

    fn thaw_tick(&mut self) -> Result<Tick<CryoTarget>> {
        let t = self.thresholds();
        let timeout = Duration::from_secs_f32(t.valve_timeout_secs);

        if self.hw.coolant_valve.is_open() {
            return Ok(self.command_valve(false, timeout));
        }
        let temperature = self.hw.thermometer.value();
        if temperature >= t.thaw_temperature {
            if self.hw.warmer.is_on() {
                info!("{}: thaw complete at {temperature:.1} °C", self.name);
                self.hw.warmer.turn_off();
            }
            return Ok(Tick::Transition(CryoTarget::Standby));
        }
        if self.hw.warmer.is_off() {
            info!("{}: starting warmer", self.name);
            self.hw.warmer.turn_on();
            return Ok(Tick::Progress);
        }
        Ok(if self.hw.thermometer.is_rising(t.falling_band) {
            Tick::Progress
        } else {
            Tick::Pending
        })
    }
}

impl Program for CryoProgram {
    type Target = CryoTarget;

    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, target: CryoTarget) -> Result<Tick<CryoTarget>> {
        // Filling against a garbage level reading is unsafe; fail stop.
        if !self.hw.thermometer.value().is_finite() {
            return Err(Error::sensor(
                self.hw.thermometer.name(),
                "non-finite temperature reading",
            ));
        }
        match target {
            CryoTarget::Standby => {
                let t = self.thresholds();
                let timeout = Duration::from_secs_f32(t.valve_timeout_secs);
                if self.hw.coolant_valve.is_open() {
                    return Ok(self.command_valve(false, timeout));
                }
                if self.hw.warmer.is_on() {
                    self.hw.warmer.turn_off();
                    return Ok(Tick::Progress);
                }
                Ok(Tick::Converged)
            }
            CryoTarget::Thaw => self.thaw_tick(),
            CryoTarget::Freeze => {
                let trigger = self.thresholds().freeze_trigger;
                Ok(self.fill_tick(trigger, false))
            }
            CryoTarget::Raise => {
                let trigger = self.thresholds().raise_trigger;
                Ok(self.fill_tick(trigger, true))
            }
        }
    }

    fn target_changed(&mut self, _from: Option<CryoTarget>, _to: CryoTarget) {
        self.opened_at = self.hw.coolant_valve.is_open().then(Instant::now);
        self.trickling = false;
    }

    fn shutdown(&mut self, action: StopAction) {
        let t = self.thresholds();
        let timeout = Duration::from_secs_f32(t.valve_timeout_secs);
        match action {
            StopAction::TurnOff => {
                if !self.hw.coolant_valve.close_wait(timeout) {
                    warn!(
                        "{}: '{}' did not confirm closed during shutdown",
                        self.name,
                        self.hw.coolant_valve.name()
                    );
                }
                self.hw.warmer.turn_off();
            }
            StopAction::TurnOn => {
                // Coolant sealed; the warmer is left to the operator.
                if !self.hw.coolant_valve.close_wait(timeout) {
                    warn!(
                        "{}: '{}' did not confirm closed during shutdown",
                        self.name,
                        self.hw.coolant_valve.name()
                    );
                }
            }
            StopAction::None => {}
        }
    }

    fn stall_limit(&self, target: CryoTarget) -> Option<Duration> {
        match target {
            CryoTarget::Standby => None,
            CryoTarget::Thaw | CryoTarget::Freeze | CryoTarget::Raise => Some(
                Duration::from_secs_f32(self.thresholds().max_minutes_to_freeze * 60.0),
            ),
        }
    }

    fn escalate_stall(&mut self, target: CryoTarget) {
        self.alerts.raise(
            Severity::Error,
            &self.name,
            &format!("no fill progress toward {target:?}; check coolant supply"),
        );
        (self.escalation)(target);
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.thresholds().poll_interval_ms))
    }
}

// ───────────────────────────────────────────────────────────────
// Controller facade
// ───────────────────────────────────────────────────────────────

/// Owns one reservoir control loop and exposes its public operations.
pub struct CryoReservoirController {
    hw: CryoHardware,
    thresholds: Arc<Mutex<CryoThresholds>>,
    supervisor: Supervisor<CryoTarget>,
}

impl CryoReservoirController {
    /// Spawn the control loop. `escalation` fires when a fill stalls past
    /// its watchdog limit.
    pub fn start(
        name: impl Into<String>,
        thresholds: CryoThresholds,
        initial: CryoTarget,
        stop_action: StopAction,
        hw: CryoHardware,
        escalation: StallEscalation,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        thresholds.validate()?;
        let thresholds = Arc::new(Mutex::new(thresholds));
        let program = CryoProgram {
            name: name.into(),
            hw: hw.clone(),
            thresholds: Arc::clone(&thresholds),
            escalation,
            alerts: Arc::clone(&alerts),
            opened_at: None,
            trickling: false,
        };
        let supervisor = Supervisor::start(initial, stop_action, program, alerts)?;
        Ok(Self {
            hw,
            thresholds,
            supervisor,
        })
    }

    pub fn set_target(&self, target: CryoTarget) {
        self.supervisor.set_target(target);
    }

    pub fn target(&self) -> CryoTarget {
        self.supervisor.target()
    }

    /// Current observed state, derived from live readings.
    pub fn state(&self) -> ReservoirState {
        derive_state(
            self.supervisor.target(),
            self.hw.thermometer.value(),
            self.hw.coolant_valve.is_open(),
            &self.thresholds(),
        )
    }

    pub fn thresholds(&self) -> CryoThresholds {
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the thresholds and wake the loop so they apply promptly.
    pub fn set_thresholds(&self, thresholds: CryoThresholds) -> Result<()> {
        thresholds.validate()?;
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = thresholds;
        self.supervisor.nudge();
        Ok(())
    }

    /// Stop the control loop and block until it has terminated.
    pub fn stop(&mut self) {
        self.supervisor.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.supervisor.is_stopped()
    }
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
