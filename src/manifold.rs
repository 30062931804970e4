//! Vacuum manifold pump/valve sequencing.
//!
//! ```text
//!                        ┌────────────┐
//!          high-vacuum   │            │   low-vacuum
//!        ┌───────▷───────┤  manifold  ├───────▷────────┐
//!        │     valve     │            │     valve      │
//!   ┌────┴────┐          └────────────┘                │
//!   │  turbo  │                                        │
//!   └────┬────┘   backing        ┌──────────┐ roughing │
//!        └─────────▷─────────────┤ foreline ├────▷─────┤
//!                  valve         └────┬─────┘ valve    │
//!                                     ▽                │
//!                               roughing pump ◁────────┘
//! ```
//!
//! The controller owns four isolation valves and the roughing pump and
//! sequences them toward one of four target modes. Observed state is never
//! stored; it is derived on demand from the actuator flags, so it cannot
//! drift from hardware reality.
//!
//! Two pressure-dependent behaviours carry deliberate hysteresis:
//! - Rough closes the low-vacuum valve at/below `high_vacuum_required` and
//!   reopens only at/above the looser `low_vacuum_required`.
//! - Evacuate switches to the turbo path at/below `high_vacuum_preferred`
//!   and retreats to roughing only at/above `low_vacuum_required`; strictly
//!   inside the band the current path is kept, so the valves never chatter
//!   at a boundary.
//!
//! Hard interlock: the backing valve is never opened (and is actively
//! closed) while foreline pressure is at/above `good_backing_pressure`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::VacuumThresholds;
use crate::error::{Error, Result};
use crate::ports::{AlertSink, Gauge, ProtectedGauge, Pump, Severity, Valve};
use crate::supervisor::{Program, StopAction, Supervisor, Tick};

// ───────────────────────────────────────────────────────────────
// Target and observed state
// ───────────────────────────────────────────────────────────────

/// Desired manifold mode, set externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifoldTarget {
    /// Manage no valves.
    Standby,
    /// Seal the manifold; keep the turbo backed if the pump runs.
    Isolate,
    /// Pump the manifold through the low-vacuum path only.
    Rough,
    /// Pump down as far as the plumbing allows, preferring the turbo path.
    Evacuate,
}

/// Manifold condition derived purely from actuator flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifoldState {
    /// Flag combination matches no recognised configuration.
    Unknown,
    /// Manifold sealed; pump idle or backing the turbo.
    Isolated,
    /// Manifold pumped through the low-vacuum path.
    Roughing,
    /// Only the foreline is being pumped.
    RoughingForeline,
    /// Manifold pumped through the backed turbo.
    HighVacuum,
    /// Roughing pump off.
    Stopped,
}

/// Snapshot of the actuator flags the state derivation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifoldFlags {
    pub pump_on: bool,
    pub roughing_open: bool,
    pub backing_open: bool,
    pub low_vacuum_open: bool,
    pub high_vacuum_open: bool,
}

/// Pure derivation: flags in, state out. No side effects, safe from any
/// thread.
#[must_use]
pub fn derive_state(f: &ManifoldFlags) -> ManifoldState {
    if !f.pump_on {
        return ManifoldState::Stopped;
    }
    if f.high_vacuum_open && f.low_vacuum_open {
        return ManifoldState::Unknown;
    }
    if f.high_vacuum_open {
        // The turbo path is only coherent while backed.
        return if f.backing_open {
            ManifoldState::HighVacuum
        } else {
            ManifoldState::Unknown
        };
    }
    if f.low_vacuum_open {
        return ManifoldState::Roughing;
    }
    if f.roughing_open && !f.backing_open {
        return ManifoldState::RoughingForeline;
    }
    ManifoldState::Isolated
}

// ───────────────────────────────────────────────────────────────
// Pure sequencing decisions
// ───────────────────────────────────────────────────────────────

/// Which pumping path Evacuate should be on at the given manifold pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvacuatePath {
    High,
    Low,
}

/// Pressure-driven path selection with the asymmetric dead-band. Inside the
/// band the currently-open path wins; with neither open the low-vacuum path
/// is the safe entry.
fn evacuate_path(
    high_open: bool,
    low_open: bool,
    pressure: f64,
    t: &VacuumThresholds,
) -> EvacuatePath {
    if pressure <= t.high_vacuum_preferred {
        EvacuatePath::High
    } else if pressure >= t.low_vacuum_required {
        EvacuatePath::Low
    } else if high_open && !low_open {
        EvacuatePath::High
    } else {
        EvacuatePath::Low
    }
}

/// Rough-mode hysteresis on the low-vacuum valve. `Some(open?)` commands a
/// change, `None` leaves the valve alone.
fn rough_valve_decision(low_open: bool, pressure: f64, t: &VacuumThresholds) -> Option<bool> {
    if low_open && pressure <= t.high_vacuum_required {
        Some(false)
    } else if !low_open && pressure >= t.low_vacuum_required {
        Some(true)
    } else {
        None
    }
}

/// Roughing valve tracks the pump: open while it runs, closed otherwise.
fn roughing_valve_decision(pump_on: bool, roughing_open: bool) -> Option<bool> {
    if pump_on && !roughing_open {
        Some(true)
    } else if !pump_on && roughing_open {
        Some(false)
    } else {
        None
    }
}

/// Backing valve interlock. Never opens against a poor foreline, and closes
/// an already-open valve on foreline regression.
fn backing_valve_decision(
    pump_on: bool,
    roughing_open: bool,
    backing_open: bool,
    foreline: f64,
    t: &VacuumThresholds,
) -> Option<bool> {
    if backing_open && foreline >= t.good_backing_pressure {
        return Some(false);
    }
    if !pump_on || !roughing_open {
        return if backing_open { Some(false) } else { None };
    }
    if !backing_open && foreline < t.good_backing_pressure {
        return Some(true);
    }
    None
}

// ───────────────────────────────────────────────────────────────
// Hardware bundle
// ───────────────────────────────────────────────────────────────

/// The device-layer handles one manifold controller commands and observes.
#[derive(Clone)]
pub struct ManifoldHardware {
    pub pump: Arc<dyn Pump>,
    pub roughing_valve: Arc<dyn Valve>,
    pub backing_valve: Arc<dyn Valve>,
    pub low_vacuum_valve: Arc<dyn Valve>,
    pub high_vacuum_valve: Arc<dyn Valve>,
    pub manifold_gauge: Arc<dyn Gauge>,
    pub foreline_gauge: Arc<dyn Gauge>,
    /// Poor-vacuum-intolerant head, energized only under the turbo
    /// interlock. Optional: not every stand carries one.
    pub protected_gauge: Option<Arc<dyn ProtectedGauge>>,
}

impl ManifoldHardware {
    fn flags(&self) -> ManifoldFlags {
        ManifoldFlags {
            pump_on: self.pump.is_on(),
            roughing_open: self.roughing_valve.is_open(),
            backing_open: self.backing_valve.is_open(),
            low_vacuum_open: self.low_vacuum_valve.is_open(),
            high_vacuum_open: self.high_vacuum_valve.is_open(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Control program
// ───────────────────────────────────────────────────────────────

struct ManifoldProgram {
    name: String,
    hw: ManifoldHardware,
    thresholds: Arc<Mutex<VacuumThresholds>>,
    gauge_override: Arc<AtomicBool>,
    baseline_since: Arc<Mutex<Option<Instant>>>,
    alerts: Arc<dyn AlertSink>,
}

impl ManifoldProgram {
    fn thresholds(&self) -> VacuumThresholds {
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sequencing valves on a garbage pressure reading is unsafe; a
    /// non-finite value fail-stops the loop.
    fn check_gauges(&self) -> Result<()> {
        for gauge in [&self.hw.manifold_gauge, &self.hw.foreline_gauge] {
            if !gauge.value().is_finite() {
                return Err(Error::sensor(gauge.name(), "non-finite pressure reading"));
            }
        }
        Ok(())
    }

    /// Issue one blocking valve command; a timeout is an alert, not an
    /// error, and the next tick retries.
    fn command_valve(&self, valve: &dyn Valve, open: bool, timeout: Duration) -> Tick<ManifoldTarget> {
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
                    "valve '{}' did not confirm {} in time",
                    valve.name(),
                    if open { "open" } else { "closed" }
                ),
            );
        }
        Tick::Progress
    }

    fn ensure_open(&self, valve: &dyn Valve, timeout: Duration) -> Option<Tick<ManifoldTarget>> {
        if valve.is_open() {
            None
        } else {
            Some(self.command_valve(valve, true, timeout))
        }
    }

    fn ensure_closed(&self, valve: &dyn Valve, timeout: Duration) -> Option<Tick<ManifoldTarget>> {
        if valve.is_closed() {
            None
        } else {
            Some(self.command_valve(valve, false, timeout))
        }
    }

    /// Roughing and backing valve management shared by every pumping
    /// target: roughing tracks the pump, backing opens only against a good
    /// foreline and closes on regression.
    fn pump_side(&self, t: &VacuumThresholds, timeout: Duration) -> Option<Tick<ManifoldTarget>> {
        let pump_on = self.hw.pump.is_on();
        let roughing_open = self.hw.roughing_valve.is_open();
        if let Some(open) = roughing_valve_decision(pump_on, roughing_open) {
            return Some(self.command_valve(&*self.hw.roughing_valve, open, timeout));
        }
        let foreline = self.hw.foreline_gauge.value();
        if let Some(open) = backing_valve_decision(
            pump_on,
            roughing_open,
            self.hw.backing_valve.is_open(),
            foreline,
            t,
        ) {
            if !open {
                warn!(
                    "{}: foreline at {foreline:.2e} Torr, closing backing valve",
                    self.name
                );
            }
            return Some(self.command_valve(&*self.hw.backing_valve, open, timeout));
        }
        None
    }

    /// Transitional verdict for a pump-down in flight: falling pressure is
    /// forward progress, a flat line feeds the stall watchdog.
    fn pumpdown_progress(&self, t: &VacuumThresholds) -> Tick<ManifoldTarget> {
        if self.hw.manifold_gauge.is_falling(t.foreline_stable_band) {
            Tick::Progress
        } else {
            Tick::Pending
        }
    }

    /// Energize the protected head exactly when the turbo interlock holds,
    /// unless an operator override has pinned it.
    fn update_gauge_protection(&self) {
        let Some(gauge) = &self.hw.protected_gauge else {
            return;
        };
        if self.gauge_override.load(Ordering::Relaxed) {
            return;
        }
        let safe = self.hw.high_vacuum_valve.is_open() && self.hw.backing_valve.is_open();
        if gauge.is_energized() != safe {
            info!(
                "{}: {} '{}'",
                self.name,
                if safe { "energizing" } else { "de-energizing" },
                gauge.name()
            );
            gauge.set_energized(safe);
        }
    }

    /// Baseline dwell bookkeeping: the timer runs only while the manifold
    /// sits at high vacuum, at/below baseline pressure, with a stable
    /// foreline. Any violation restarts it from zero.
    fn note_baseline(&self, t: &VacuumThresholds) {
        let holding = derive_state(&self.hw.flags()) == ManifoldState::HighVacuum
            && self.hw.manifold_gauge.value() <= t.baseline_pressure
            && self.hw.foreline_gauge.is_stable(t.foreline_stable_band);
        let mut since = self
            .baseline_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if holding {
            if since.is_none() {
                *since = Some(Instant::now());
            }
        } else {
            *since = None;
        }
    }
}

impl Program for ManifoldProgram {
    type Target = ManifoldTarget;

    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, target: ManifoldTarget) -> Result<Tick<ManifoldTarget>> {
        let t = self.thresholds();
        let timeout = Duration::from_secs_f32(t.valve_timeout_secs);

        self.check_gauges()?;
        self.update_gauge_protection();
        self.note_baseline(&t);

        match target {
            ManifoldTarget::Standby => Ok(Tick::Converged),
            ManifoldTarget::Isolate => {
                if let Some(tick) = self.ensure_closed(&*self.hw.high_vacuum_valve, timeout) {
                    return Ok(tick);
                }
                if let Some(tick) = self.ensure_closed(&*self.hw.low_vacuum_valve, timeout) {
                    return Ok(tick);
                }
                if let Some(tick) = self.pump_side(&t, timeout) {
                    return Ok(tick);
                }
                if self.hw.pump.is_on() && self.hw.backing_valve.is_closed() {
                    // Backing waits for the foreline to come down.
                    return Ok(
                        if self.hw.foreline_gauge.is_falling(t.foreline_stable_band) {
                            Tick::Progress
                        } else {
                            Tick::Pending
                        },
                    );
                }
                Ok(Tick::Converged)
            }
            ManifoldTarget::Rough => {
                if let Some(tick) = self.ensure_closed(&*self.hw.high_vacuum_valve, timeout) {
                    return Ok(tick);
                }
                if let Some(tick) = self.pump_side(&t, timeout) {
                    return Ok(tick);
                }
                let pressure = self.hw.manifold_gauge.value();
                if let Some(open) =
                    rough_valve_decision(self.hw.low_vacuum_valve.is_open(), pressure, &t)
                {
                    return Ok(self.command_valve(&*self.hw.low_vacuum_valve, open, timeout));
                }
                if self.hw.low_vacuum_valve.is_open() {
                    // Still pumping toward backed isolation.
                    return Ok(self.pumpdown_progress(&t));
                }
                Ok(Tick::Converged)
            }
            ManifoldTarget::Evacuate => {
                let pressure = self.hw.manifold_gauge.value();
                let path = evacuate_path(
                    self.hw.high_vacuum_valve.is_open(),
                    self.hw.low_vacuum_valve.is_open(),
                    pressure,
                    &t,
                );
                match path {
                    EvacuatePath::High => {
                        if let Some(tick) = self.ensure_closed(&*self.hw.low_vacuum_valve, timeout)
                        {
                            return Ok(tick);
                        }
                        if let Some(tick) = self.pump_side(&t, timeout) {
                            return Ok(tick);
                        }
                        if self.hw.backing_valve.is_closed() {
                            // The gate must not open until backing is
                            // confirmed; wait out the foreline.
                            return Ok(
                                if self.hw.foreline_gauge.is_falling(t.foreline_stable_band) {
                                    Tick::Progress
                                } else {
                                    Tick::Pending
                                },
                            );
                        }
                        if let Some(tick) = self.ensure_open(&*self.hw.high_vacuum_valve, timeout)
                        {
                            return Ok(tick);
                        }
                        Ok(Tick::Converged)
                    }
                    EvacuatePath::Low => {
                        if let Some(tick) =
                            self.ensure_closed(&*self.hw.high_vacuum_valve, timeout)
                        {
                            return Ok(tick);
                        }
                        if let Some(tick) = self.pump_side(&t, timeout) {
                            return Ok(tick);
                        }
                        if let Some(tick) = self.ensure_open(&*self.hw.low_vacuum_valve, timeout) {
                            return Ok(tick);
                        }
                        // Roughing is a way-station for Evacuate.
                        Ok(self.pumpdown_progress(&t))
                    }
                }
            }
        }
    }

    fn target_changed(&mut self, _from: Option<ManifoldTarget>, _to: ManifoldTarget) {
        *self
            .baseline_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn shutdown(&mut self, action: StopAction) {
        let t = self.thresholds();
        let timeout = Duration::from_secs_f32(t.valve_timeout_secs);
        match action {
            StopAction::TurnOff => {
                for valve in [
                    &self.hw.high_vacuum_valve,
                    &self.hw.low_vacuum_valve,
                    &self.hw.backing_valve,
                    &self.hw.roughing_valve,
                ] {
                    if !valve.close_wait(timeout) {
                        warn!(
                            "{}: '{}' did not confirm closed during shutdown",
                            self.name,
                            valve.name()
                        );
                    }
                }
                self.hw.pump.turn_off();
                if let Some(gauge) = &self.hw.protected_gauge {
                    gauge.set_energized(false);
                }
            }
            StopAction::TurnOn => {
                // Park in backed isolation: manifold sealed, pump and
                // backing left as they stand.
                for valve in [&self.hw.high_vacuum_valve, &self.hw.low_vacuum_valve] {
                    if !valve.close_wait(timeout) {
                        warn!(
                            "{}: '{}' did not confirm closed during shutdown",
                            self.name,
                            valve.name()
                        );
                    }
                }
            }
            StopAction::None => {}
        }
    }

    fn stall_limit(&self, target: ManifoldTarget) -> Option<Duration> {
        match target {
            ManifoldTarget::Rough | ManifoldTarget::Evacuate => Some(Duration::from_secs_f32(
                self.thresholds().pumpdown_stall_minutes * 60.0,
            )),
            ManifoldTarget::Standby | ManifoldTarget::Isolate => None,
        }
    }

    fn escalate_stall(&mut self, target: ManifoldTarget) {
        self.alerts.raise(
            Severity::Error,
            &self.name,
            &format!(
                "pump-down toward {target:?} has stalled; check for leaks and pump condition"
            ),
        );
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.thresholds().poll_interval_ms))
    }
}

// ───────────────────────────────────────────────────────────────
// Controller facade
// ───────────────────────────────────────────────────────────────

/// Owns the manifold control loop and exposes its public operations.
///
/// The supervisor thread is the sole commander of the five actuators;
/// everything here besides `set_target`/`stop` is a pure read or a
/// threshold update.
pub struct VacuumManifoldController {
    hw: ManifoldHardware,
    thresholds: Arc<Mutex<VacuumThresholds>>,
    gauge_override: Arc<AtomicBool>,
    baseline_since: Arc<Mutex<Option<Instant>>>,
    supervisor: Supervisor<ManifoldTarget>,
}

impl VacuumManifoldController {
    /// Spawn the control loop.
    pub fn start(
        name: impl Into<String>,
        thresholds: VacuumThresholds,
        initial: ManifoldTarget,
        stop_action: StopAction,
        hw: ManifoldHardware,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        thresholds.validate()?;
        let thresholds = Arc::new(Mutex::new(thresholds));
        let gauge_override = Arc::new(AtomicBool::new(false));
        let baseline_since = Arc::new(Mutex::new(None));
        let program = ManifoldProgram {
            name: name.into(),
            hw: hw.clone(),
            thresholds: Arc::clone(&thresholds),
            gauge_override: Arc::clone(&gauge_override),
            baseline_since: Arc::clone(&baseline_since),
            alerts: Arc::clone(&alerts),
        };
        let supervisor = Supervisor::start(initial, stop_action, program, alerts)?;
        Ok(Self {
            hw,
            thresholds,
            gauge_override,
            baseline_since,
            supervisor,
        })
    }

    pub fn set_target(&self, target: ManifoldTarget) {
        self.supervisor.set_target(target);
    }

    pub fn target(&self) -> ManifoldTarget {
        self.supervisor.target()
    }

    /// Current observed state, derived from live actuator flags.
    pub fn state(&self) -> ManifoldState {
        derive_state(&self.hw.flags())
    }

    /// How long the manifold has continuously held baseline conditions.
    pub fn baseline_dwell(&self) -> Duration {
        self.baseline_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(Duration::ZERO, |since| since.elapsed())
    }

    pub fn thresholds(&self) -> VacuumThresholds {
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the thresholds and wake the loop so they apply promptly.
    pub fn set_thresholds(&self, thresholds: VacuumThresholds) -> Result<()> {
        thresholds.validate()?;
        *self
            .thresholds
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = thresholds;
        self.supervisor.nudge();
        Ok(())
    }

    /// Pin the protected gauge under operator control; the loop stops
    /// managing its energize state until released. Fails on stands that
    /// carry no protected gauge.
    pub fn set_gauge_override(&self, on: bool) -> Result<()> {
        if self.hw.protected_gauge.is_none() {
            return Err(Error::MissingCollaborator("protected gauge"));
        }
        self.gauge_override.store(on, Ordering::Relaxed);
        self.supervisor.nudge();
        Ok(())
    }

    pub fn gauge_override(&self) -> bool {
        self.gauge_override.load(Ordering::Relaxed)
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
