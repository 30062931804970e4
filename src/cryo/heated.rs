//! Heated-regulation reservoir variant.
//!
//! Composes the reservoir fill logic with an independent heater output so
//! the trap can hold an intermediate temperature (coolant pulls down,
//! heater pushes up). The two sides must never fight: heater power is
//! enabled only while cooling is in a confirmed-safe state, meaning the
//! coolant valve is closed and the level sits at or inside its trigger
//! margin. An independent safety thermometer forces the output off the
//! moment it exceeds its limit, latching [`HeaterState::Lockout`] until
//! the reading recovers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{CryoThresholds, HeaterConfig};
use crate::error::{Error, Result};
use crate::ports::{AlertSink, Gauge, Pump, Severity};
use crate::supervisor::{Program, StopAction, Supervisor, Tick};

use super::{CryoHardware, CryoProgram, CryoTarget, ReservoirState, StallEscalation, derive_state};

// ───────────────────────────────────────────────────────────────
// Target and heater state
// ───────────────────────────────────────────────────────────────

/// Desired mode for a heated reservoir; extends the plain reservoir modes
/// with heated regulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeatedTarget {
    Standby,
    Thaw,
    Freeze,
    Raise,
    /// Hold `hold_temperature` with the heater while keeping the
    /// reservoir topped up.
    Regulate,
}

impl HeatedTarget {
    /// The fill behaviour backing each mode. Regulate keeps the reservoir
    /// cold with the minimal-fill trigger; the heater works on top of it.
    fn cooling(self) -> CryoTarget {
        match self {
            Self::Standby => CryoTarget::Standby,
            Self::Thaw => CryoTarget::Thaw,
            Self::Freeze | Self::Regulate => CryoTarget::Freeze,
            Self::Raise => CryoTarget::Raise,
        }
    }
}

/// Heater output state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaterState {
    /// Not regulating (or cooling not in a safe state).
    Off,
    /// Output energised, pushing toward the hold temperature.
    Heating,
    /// At temperature inside the band, output off.
    Holding,
    /// Safety thermometer tripped; output forced off until it recovers.
    Lockout,
}

/// One step of the heater state machine. Pure: `(next state, output on?)`.
fn heater_decision(
    state: HeaterState,
    safety: f64,
    regulating: bool,
    cooling_safe: bool,
    temperature: f64,
    cfg: &HeaterConfig,
) -> (HeaterState, bool) {
    if safety >= cfg.safety_limit {
        return (HeaterState::Lockout, false);
    }
    if !regulating || !cooling_safe {
        return (HeaterState::Off, false);
    }
    if temperature <= cfg.hold_temperature - cfg.hold_band {
        (HeaterState::Heating, true)
    } else if temperature >= cfg.hold_temperature + cfg.hold_band {
        (HeaterState::Holding, false)
    } else {
        // Inside the band: keep the current output.
        match state {
            HeaterState::Heating => (HeaterState::Heating, true),
            _ => (HeaterState::Holding, false),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Control program
// ───────────────────────────────────────────────────────────────

struct HeatedProgram {
    cooling: CryoProgram,
    heater: Arc<dyn Pump>,
    /// Thermometer at the regulation point.
    regulation_thermometer: Arc<dyn Gauge>,
    /// Independent safety thermometer; never shared with regulation.
    safety_thermometer: Arc<dyn Gauge>,
    heater_cfg: Arc<Mutex<HeaterConfig>>,
    heater_state: Arc<Mutex<HeaterState>>,
    alerts: Arc<dyn AlertSink>,
}

impl HeatedProgram {
    fn heater_cfg(&self) -> HeaterConfig {
        *self
            .heater_cfg
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> HeaterState {
        *self
            .heater_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: HeaterState) {
        *self
            .heater_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run the heater state machine and apply its output. Non-blocking;
    /// runs every tick regardless of what the fill side is doing.
    fn arbitrate_heater(&mut self, target: HeatedTarget) {
        let cfg = self.heater_cfg();
        let safety = self.safety_thermometer.value();
        let cooling_safe = self.cooling.hw.coolant_valve.is_closed()
            && level_within_band(&self.cooling, target);
        let before = self.state();
        let (after, output_on) = heater_decision(
            before,
            safety,
            target == HeatedTarget::Regulate,
            cooling_safe,
            self.regulation_thermometer.value(),
            &cfg,
        );

        if after == HeaterState::Lockout && before != HeaterState::Lockout {
            warn!(
                "{}: safety thermometer at {safety:.1} °C, heater locked out",
                self.cooling.name
            );
            self.alerts.raise(
                Severity::Error,
                &self.cooling.name,
                &format!("heater safety limit exceeded ({safety:.1} °C); output forced off"),
            );
        } else if before == HeaterState::Lockout && after != HeaterState::Lockout {
            info!("{}: safety thermometer recovered, heater released", self.cooling.name);
        }

        if output_on != self.heater.is_on() {
            if output_on {
                self.heater.turn_on();
            } else {
                self.heater.turn_off();
            }
        }
        self.set_state(after);
    }
}

/// Whether the level side counts as safe for heater arbitration: at level
/// or inside the active trigger margin.
fn level_within_band(cooling: &CryoProgram, target: HeatedTarget) -> bool {
    let t = cooling.thresholds();
    let trigger = match target.cooling() {
        CryoTarget::Raise => t.raise_trigger,
        _ => t.freeze_trigger,
    };
    cooling.hw.thermometer.value() < t.frozen_temperature + trigger
}

fn lift(tick: Tick<CryoTarget>) -> Tick<HeatedTarget> {
    match tick {
        Tick::Converged => Tick::Converged,
        Tick::Progress => Tick::Progress,
        Tick::Pending => Tick::Pending,
        // The only self-transition the fill side requests is Thaw
        // completing into Standby.
        Tick::Transition(_) => Tick::Transition(HeatedTarget::Standby),
    }
}

impl Program for HeatedProgram {
    type Target = HeatedTarget;

    fn name(&self) -> &str {
        &self.cooling.name
    }

    fn tick(&mut self, target: HeatedTarget) -> Result<Tick<HeatedTarget>> {
        // A NaN safety reading would sail past the lockout comparison;
        // fail stop instead of heating blind.
        for thermometer in [&self.safety_thermometer, &self.regulation_thermometer] {
            if !thermometer.value().is_finite() {
                self.heater.turn_off();
                return Err(Error::sensor(
                    thermometer.name(),
                    "non-finite temperature reading",
                ));
            }
        }
        self.arbitrate_heater(target);
        let tick = self.cooling.tick(target.cooling())?;
        Ok(lift(tick))
    }

    fn target_changed(&mut self, from: Option<HeatedTarget>, to: HeatedTarget) {
        self.cooling
            .target_changed(from.map(HeatedTarget::cooling), to.cooling());
    }

    fn shutdown(&mut self, action: StopAction) {
        // The heater output is never left energised, whatever the action.
        self.heater.turn_off();
        self.set_state(HeaterState::Off);
        self.cooling.shutdown(action);
    }

    fn stall_limit(&self, target: HeatedTarget) -> Option<Duration> {
        self.cooling.stall_limit(target.cooling())
    }

    fn escalate_stall(&mut self, target: HeatedTarget) {
        self.cooling.escalate_stall(target.cooling());
    }

    fn poll_interval(&self) -> Duration {
        self.cooling.poll_interval()
    }
}

// ───────────────────────────────────────────────────────────────
// Controller facade
// ───────────────────────────────────────────────────────────────

/// Owns one heated-reservoir control loop.
pub struct HeatedReservoirController {
    hw: CryoHardware,
    thresholds: Arc<Mutex<CryoThresholds>>,
    heater_cfg: Arc<Mutex<HeaterConfig>>,
    heater_state: Arc<Mutex<HeaterState>>,
    supervisor: Supervisor<HeatedTarget>,
}

impl HeatedReservoirController {
    /// Spawn the control loop. `heater` is the heater output;
    /// `regulation_thermometer` and `safety_thermometer` must be
    /// independent sensors.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        name: impl Into<String>,
        thresholds: CryoThresholds,
        heater_cfg: HeaterConfig,
        initial: HeatedTarget,
        stop_action: StopAction,
        hw: CryoHardware,
        heater: Arc<dyn Pump>,
        regulation_thermometer: Arc<dyn Gauge>,
        safety_thermometer: Arc<dyn Gauge>,
        escalation: StallEscalation,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        thresholds.validate()?;
        heater_cfg.validate()?;
        let thresholds = Arc::new(Mutex::new(thresholds));
        let heater_cfg = Arc::new(Mutex::new(heater_cfg));
        let heater_state = Arc::new(Mutex::new(HeaterState::Off));
        let cooling = CryoProgram {
            name: name.into(),
            hw: hw.clone(),
            thresholds: Arc::clone(&thresholds),
            escalation,
            alerts: Arc::clone(&alerts),
            opened_at: None,
            trickling: false,
        };
        let program = HeatedProgram {
            cooling,
            heater,
            regulation_thermometer,
            safety_thermometer,
            heater_cfg: Arc::clone(&heater_cfg),
            heater_state: Arc::clone(&heater_state),
            alerts: Arc::clone(&alerts),
        };
        let supervisor = Supervisor::start(initial, stop_action, program, alerts)?;
        Ok(Self {
            hw,
            thresholds,
            heater_cfg,
            heater_state,
            supervisor,
        })
    }

    pub fn set_target(&self, target: HeatedTarget) {
        self.supervisor.set_target(target);
    }

    pub fn target(&self) -> HeatedTarget {
        self.supervisor.target()
    }

    /// Observed state of the fill side.
    pub fn state(&self) -> ReservoirState {
        derive_state(
            self.supervisor.target().cooling(),
            self.hw.thermometer.value(),
            self.hw.coolant_valve.is_open(),
            &self.thresholds(),
        )
    }

    /// Current heater output state.
    pub fn heater_state(&self) -> HeaterState {
        *self
            .heater_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn thresholds(&self) -> CryoThresholds {
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_thresholds(&self, thresholds: CryoThresholds) -> Result<()> {
        thresholds.validate()?;
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = thresholds;
        self.supervisor.nudge();
        Ok(())
    }

    pub fn heater_config(&self) -> HeaterConfig {
        *self
            .heater_cfg
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_heater_config(&self, cfg: HeaterConfig) -> Result<()> {
        cfg.validate()?;
        *self
            .heater_cfg
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cfg;
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
