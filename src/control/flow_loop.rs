//! Adaptive closed-loop flow controller.
//!
//! Converges a monitored scalar (a pressure, or its rate of change) to a
//! target by repositioning one bounded proportional valve in small
//! incremental steps rather than a single jump, which would hammer the seat
//! and overshoot under transport lag.
//!
//! The per-cycle algorithm lives in [`FlowLoop::cycle`], a pure planning
//! step over one [`LoopReading`], so it can be simulated tick-by-tick in
//! tests. [`FlowLoopController`] wraps it in a dedicated cycle thread that
//! reads the gauge, issues the planned move as a single awaited relative
//! motion, and then opens the next cycle's timing window.
//!
//! The adaptive gain scale (×0.9 on overshoot, ×1.2 on undercorrection) is a
//! field-tuned heuristic with no proven convergence bound; it is preserved
//! as-is and observable through [`FlowLoop::adaptive_scale`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ports::{AlertSink, Gauge, ProportionalValve, Severity, ValveLimit};

/// Overshoot: shrink the adaptive scale by this factor.
const SCALE_SHRINK: f64 = 0.9;
/// Undercorrection: grow the adaptive scale by this factor.
const SCALE_GROW: f64 = 1.2;
/// EWMA weight for a fresh steps-per-rate sample.
const RATE_COEFF_ALPHA: f64 = 0.2;
/// Position delta (steps) below which a coefficient sample is noise.
const MIN_SIGNIFICANT_STEPS: f64 = 1.0;
/// Rate delta below which a coefficient sample is noise.
const MIN_SIGNIFICANT_RATE: f64 = 1e-6;
/// Anti-stall: force a one-step nudge when time-to-target exceeds this
/// multiple of max(lag, cycle).
const STALL_PATIENCE: f64 = 4.0;

// ───────────────────────────────────────────────────────────────
// Parameters
// ───────────────────────────────────────────────────────────────

/// Tuning parameters for one flow loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowLoopParams {
    /// Base gain, actuator steps per unit of error.
    pub gain: f64,
    /// Tolerance window within which no corrective move is issued.
    pub deadband: f64,
    /// Transport lag between a valve move and the monitored value
    /// responding (seconds).
    pub lag_secs: f64,
    /// Maximum single-cycle movement (steps).
    pub max_step: f64,
    /// Nominal cycle time (seconds).
    pub cycle_secs: f64,
    /// Minimum actuator response time (seconds); floors the cycle.
    pub min_actuator_period_secs: f64,
    /// |rate| beyond which the loop manages the rate instead of the value.
    pub max_rate: f64,
    /// The target is itself a rate of change.
    pub target_is_rate: bool,
    /// Direction convention: `true` when increasing valve position
    /// increases the monitored value.
    pub opens_increase: bool,
    /// Terminate the loop automatically when the valve reaches this travel
    /// limit (no further control is possible there).
    pub stop_at_limit: Option<ValveLimit>,
}

impl Default for FlowLoopParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            deadband: 0.5,
            lag_secs: 0.5,
            max_step: 100.0,
            cycle_secs: 0.75,
            min_actuator_period_secs: 0.035,
            max_rate: 50.0,
            target_is_rate: false,
            opens_increase: true,
            stop_at_limit: None,
        }
    }
}

impl FlowLoopParams {
    /// Effective cycle time, floored by the actuator response time.
    pub fn cycle(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_secs.max(self.min_actuator_period_secs))
    }
}

/// One cycle's sensor/actuator observation.
#[derive(Debug, Clone, Copy)]
pub struct LoopReading {
    pub value: f64,
    pub rate: f64,
    pub position: f64,
}

/// The planned actuator movement for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepPlan {
    /// Within the deadband (or no useful move): hold position.
    Hold,
    /// Issue one incremental relative move of this many steps.
    Move(f64),
}

// ───────────────────────────────────────────────────────────────
// Pure per-cycle core
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PrevCycle {
    error: f64,
    position: f64,
    rate: f64,
    commanded: f64,
}

/// The planning core: owns the adaptive state, no hardware.
#[derive(Debug)]
pub struct FlowLoop {
    params: FlowLoopParams,
    target: f64,
    /// Running multiplier on the base gain.
    scale: f64,
    /// Online estimate of actuator steps per unit of rate change (signed by
    /// the direction convention). Zero until enough consistent samples.
    steps_per_rate: f64,
    prev: Option<PrevCycle>,
}

impl FlowLoop {
    pub fn new(params: FlowLoopParams, target: f64) -> Self {
        Self {
            params,
            target,
            scale: 1.0,
            steps_per_rate: 0.0,
            prev: None,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn params(&self) -> FlowLoopParams {
        self.params
    }

    /// Replace the tuning parameters; adaptive state carries over.
    pub fn set_params(&mut self, params: FlowLoopParams) {
        self.params = params;
    }

    /// Current adaptive gain multiplier (heuristic, unbounded by design).
    pub fn adaptive_scale(&self) -> f64 {
        self.scale
    }

    /// Current steps-per-rate estimate.
    pub fn rate_coefficient(&self) -> f64 {
        self.steps_per_rate
    }

    /// Clear adaptive state (e.g. after the plant was reconfigured).
    pub fn reset(&mut self) {
        self.scale = 1.0;
        self.steps_per_rate = 0.0;
        self.prev = None;
    }

    /// Plan one cycle's movement from the latest reading.
    pub fn cycle(&mut self, r: &LoopReading) -> StepPlan {
        let p = self.params;
        let cycle_secs = p.cycle_secs.max(p.min_actuator_period_secs);
        let dir = if p.opens_increase { 1.0 } else { -1.0 };

        // Anticipate where the value will be once in-flight gas settles.
        let anticipated = r.value + r.rate * p.lag_secs;
        let rate_mode = p.target_is_rate || p.lag_secs > cycle_secs || r.rate.abs() > p.max_rate;

        let error = if p.target_is_rate {
            r.rate - self.target
        } else if rate_mode {
            anticipated - self.target
        } else {
            r.value - self.target
        };

        self.adapt(error, r, dir);

        if error.abs() <= p.deadband {
            self.prev = Some(PrevCycle {
                error,
                position: r.position,
                rate: r.rate,
                commanded: 0.0,
            });
            return StepPlan::Hold;
        }

        let movement = if rate_mode {
            let target_rate = if p.target_is_rate {
                self.target
            } else {
                // Close the remaining error over one lag period.
                (self.target - r.value) / p.lag_secs.max(cycle_secs)
            };
            if self.steps_per_rate != 0.0 {
                self.steps_per_rate * (target_rate - r.rate)
            } else {
                // No usable estimate yet; bootstrap from the base gain.
                dir * p.gain * self.scale * (target_rate - r.rate)
            }
        } else {
            dir * p.gain * self.scale * (-error)
        };

        let clamped = movement.clamp(-p.max_step, p.max_step);
        let mut steps = clamped.round();

        // Anti-stall: a sub-step command with the deadband still exceeded
        // and no hope of drifting there in reasonable time gets a one-unit
        // nudge in the correct direction.
        if steps == 0.0 {
            let time_to_target = error.abs() / r.rate.abs().max(1e-12);
            if time_to_target > STALL_PATIENCE * p.lag_secs.max(cycle_secs) {
                steps = if clamped >= 0.0 { 1.0 } else { -1.0 };
            }
        }

        self.prev = Some(PrevCycle {
            error,
            position: r.position,
            rate: r.rate,
            commanded: steps,
        });

        if steps == 0.0 {
            StepPlan::Hold
        } else {
            StepPlan::Move(steps)
        }
    }

    /// Update the adaptive scale and the steps-per-rate estimate from the
    /// previous cycle's outcome.
    fn adapt(&mut self, error: f64, r: &LoopReading, dir: f64) {
        let Some(prev) = self.prev else {
            return;
        };

        if prev.commanded != 0.0 && prev.error != 0.0 && error != 0.0 {
            if error.signum() != prev.error.signum() {
                // Sign reversal after a move: overshoot.
                self.scale *= SCALE_SHRINK;
            } else if error.abs() > prev.error.abs() {
                // Error grew despite a commanded move: undercorrection.
                self.scale *= SCALE_GROW;
            }
        }

        let dpos = r.position - prev.position;
        let drate = r.rate - prev.rate;
        if dpos.abs() >= MIN_SIGNIFICANT_STEPS && drate.abs() >= MIN_SIGNIFICANT_RATE {
            let sample = dpos / drate;
            // Accept only samples whose sign matches the direction
            // convention; inconsistent signs are load disturbances.
            if sample.signum() == dir {
                if self.steps_per_rate == 0.0 {
                    self.steps_per_rate = sample;
                } else {
                    self.steps_per_rate +=
                        RATE_COEFF_ALPHA * (sample - self.steps_per_rate);
                }
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Threaded runner
// ───────────────────────────────────────────────────────────────

struct RunnerCell {
    stop: bool,
    generation: u64,
}

struct RunnerShared {
    core: Mutex<FlowLoop>,
    cell: Mutex<RunnerCell>,
    wake: Condvar,
    stopped: AtomicBool,
}

impl RunnerShared {
    fn wait_cycle(&self, seen: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        while !cell.stop && cell.generation == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, result) = self
                .wake
                .wait_timeout(cell, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            cell = guard;
            if result.timed_out() {
                break;
            }
        }
    }
}

/// Owns the cycle thread driving one proportional valve toward the target.
pub struct FlowLoopController {
    name: String,
    shared: Arc<RunnerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FlowLoopController {
    /// Spawn the cycle thread. The controller is the sole commander of
    /// `valve`; collaborators adjust the loop through [`set_target`]
    /// (`Self::set_target`) and [`set_params`](Self::set_params).
    pub fn start(
        name: impl Into<String>,
        params: FlowLoopParams,
        target: f64,
        valve: Arc<dyn ProportionalValve>,
        gauge: Arc<dyn Gauge>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(RunnerShared {
            core: Mutex::new(FlowLoop::new(params, target)),
            cell: Mutex::new(RunnerCell {
                stop: false,
                generation: 0,
            }),
            wake: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let loop_name = name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_cycles(&loop_name, &loop_shared, &*valve, &*gauge, &*alerts))
            .map_err(|e| Error::ControlLoop(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            name,
            shared,
            thread: Some(thread),
        })
    }

    /// Update the setpoint and wake the loop.
    pub fn set_target(&self, target: f64) {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_target(target);
        self.nudge();
    }

    pub fn target(&self) -> f64 {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .target()
    }

    pub fn params(&self) -> FlowLoopParams {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .params()
    }

    /// Replace tuning parameters and wake the loop.
    pub fn set_params(&self, params: FlowLoopParams) {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_params(params);
        self.nudge();
    }

    pub fn adaptive_scale(&self) -> f64 {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .adaptive_scale()
    }

    fn nudge(&self) {
        let mut cell = self.shared.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.generation += 1;
        drop(cell);
        self.shared.wake.notify_all();
    }

    /// Signal the loop to stop and block until it has terminated.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        {
            let mut cell = self.shared.cell.lock().unwrap_or_else(PoisonError::into_inner);
            cell.stop = true;
        }
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            log::error!("{}: cycle thread panicked during shutdown", self.name);
            self.shared.stopped.store(true, Ordering::Release);
        }
    }

    /// Whether the loop has terminated (stop, or travel-limit reached).
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl Drop for FlowLoopController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_cycles(
    name: &str,
    shared: &RunnerShared,
    valve: &dyn ProportionalValve,
    gauge: &dyn Gauge,
    alerts: &dyn AlertSink,
) {
    info!("{name}: flow loop started on valve '{}'", valve.name());
    loop {
        let (generation, stop) = {
            let cell = shared.cell.lock().unwrap_or_else(PoisonError::into_inner);
            (cell.generation, cell.stop)
        };
        if stop {
            break;
        }

        let reading = LoopReading {
            value: gauge.value(),
            rate: gauge.rate(),
            position: valve.position(),
        };
        let (plan, cycle, stop_at_limit) = {
            let mut core = shared.core.lock().unwrap_or_else(PoisonError::into_inner);
            let plan = core.cycle(&reading);
            let p = core.params();
            (plan, p.cycle(), p.stop_at_limit)
        };

        if let StepPlan::Move(steps) = plan {
            debug!("{name}: moving {steps:+.0} steps at value {:.4}", reading.value);
            // The single awaited actuator operation of this cycle.
            if !valve.move_relative(steps, cycle) {
                warn!("{name}: relative move not confirmed in time");
                alerts.raise(
                    Severity::Warning,
                    name,
                    &format!("valve '{}' move not confirmed in time", valve.name()),
                );
            }
        }

        if let Some(limit) = stop_at_limit {
            if valve.at_limit() == Some(limit) {
                info!("{name}: valve reached {limit:?}, flow loop finished");
                alerts.raise(
                    Severity::Info,
                    name,
                    &format!("valve '{}' reached {limit:?}; loop stopped", valve.name()),
                );
                break;
            }
        }

        // The next cycle's timing window opens after the awaited move.
        shared.wait_cycle(generation, cycle);
    }
    shared.stopped.store(true, Ordering::Release);
    info!("{name}: flow loop stopped");
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
