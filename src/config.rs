//! Stand configuration parameters.
//!
//! All tunable thresholds for the supervision core. An external persistence
//! layer loads and saves these via the [`ConfigStore`](crate::ports::ConfigStore)
//! port; the core treats them as plain values. Threshold mutation at runtime
//! goes through each controller's setter, which nudges its control loop
//! without resetting state.
//!
//! Pressures are in Torr, temperatures in °C, rates in units per second.

use serde::{Deserialize, Serialize};

use crate::control::flow_loop::FlowLoopParams;
use crate::error::{Error, Result};
use crate::cryo::CryoTarget;
use crate::manifold::ManifoldTarget;

/// Thresholds for the vacuum manifold controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VacuumThresholds {
    /// Foreline pressure below which the backing valve may open (turbo
    /// protection interlock).
    pub good_backing_pressure: f64,
    /// Manifold pressure at/above which the low-vacuum path must (re)open.
    pub low_vacuum_required: f64,
    /// Manifold pressure below which Evacuate switches to the high-vacuum
    /// path.
    pub high_vacuum_preferred: f64,
    /// Manifold pressure at/below which Rough closes the low-vacuum valve
    /// (backed isolation).
    pub high_vacuum_required: f64,
    /// Pressure considered fully evacuated for practical purposes.
    pub baseline_pressure: f64,
    /// |foreline rate| band (Torr/s) considered stable for the baseline
    /// dwell timer.
    pub foreline_stable_band: f64,
    /// Maximum wait for a valve to confirm motion (seconds).
    pub valve_timeout_secs: f32,
    /// Minutes without convergence or progress before the stall watchdog
    /// escalates.
    pub pumpdown_stall_minutes: f32,
    /// Control loop poll interval (milliseconds).
    pub poll_interval_ms: u32,
}

impl Default for VacuumThresholds {
    fn default() -> Self {
        Self {
            good_backing_pressure: 5e-1,
            low_vacuum_required: 5e-3,
            high_vacuum_preferred: 1e-3,
            high_vacuum_required: 1e-3,
            baseline_pressure: 5e-6,
            foreline_stable_band: 1e-2,
            valve_timeout_secs: 10.0,
            pumpdown_stall_minutes: 30.0,
            poll_interval_ms: 500,
        }
    }
}

impl VacuumThresholds {
    /// Rejects threshold sets whose hysteresis bands are inverted or whose
    /// waits are non-positive. Controllers refuse to start on a bad set.
    pub fn validate(&self) -> Result<()> {
        if self.high_vacuum_preferred >= self.low_vacuum_required {
            return Err(Error::Config(
                "high_vacuum_preferred must sit below low_vacuum_required".into(),
            ));
        }
        if self.high_vacuum_required > self.low_vacuum_required {
            return Err(Error::Config(
                "high_vacuum_required must not exceed low_vacuum_required".into(),
            ));
        }
        if self.good_backing_pressure <= 0.0 || self.baseline_pressure <= 0.0 {
            return Err(Error::Config("pressure thresholds must be positive".into()));
        }
        if self.valve_timeout_secs <= 0.0 || self.poll_interval_ms == 0 {
            return Err(Error::Config("waits must be positive".into()));
        }
        Ok(())
    }
}

/// Thresholds for a cryogenic reservoir controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CryoThresholds {
    /// Level-sensor temperature at/below which the reservoir is full.
    pub frozen_temperature: f64,
    /// Margin above `frozen_temperature` that triggers a minimal-fill
    /// (Freeze) top-up. Looser than `raise_trigger`.
    pub freeze_trigger: f64,
    /// Margin above `frozen_temperature` that triggers a maximal-fill
    /// (Raise) top-up. Tighter than `freeze_trigger`.
    pub raise_trigger: f64,
    /// Near-ambient temperature at which a thaw is complete.
    pub thaw_temperature: f64,
    /// Continuous-open cap on the coolant valve (seconds); exceeding it
    /// forces a close/reopen cycle so the seat never sticks.
    pub max_open_secs: f32,
    /// Maximum wait for the coolant valve to confirm motion (seconds).
    pub valve_timeout_secs: f32,
    /// Minutes a fill may run without reaching level (or showing falling
    /// temperature) before the stall watchdog escalates.
    pub max_minutes_to_freeze: f32,
    /// |temperature rate| band (°C/s) below which the reading counts as
    /// falling for watchdog progress.
    pub falling_band: f64,
    /// Control loop poll interval (milliseconds).
    pub poll_interval_ms: u32,
}

impl Default for CryoThresholds {
    fn default() -> Self {
        Self {
            frozen_temperature: -192.0,
            freeze_trigger: 5.0,
            raise_trigger: 2.0,
            thaw_temperature: 10.0,
            max_open_secs: 180.0,
            valve_timeout_secs: 10.0,
            max_minutes_to_freeze: 20.0,
            falling_band: 0.05,
            poll_interval_ms: 500,
        }
    }
}

impl CryoThresholds {
    /// Rejects trigger margins that are inverted (the minimal-fill margin
    /// must be the looser of the two) and non-positive waits.
    pub fn validate(&self) -> Result<()> {
        if self.freeze_trigger <= self.raise_trigger {
            return Err(Error::Config(
                "freeze_trigger must be looser than raise_trigger".into(),
            ));
        }
        if self.thaw_temperature <= self.frozen_temperature {
            return Err(Error::Config(
                "thaw_temperature must lie above frozen_temperature".into(),
            ));
        }
        if self.max_open_secs <= 0.0
            || self.valve_timeout_secs <= 0.0
            || self.max_minutes_to_freeze <= 0.0
            || self.poll_interval_ms == 0
        {
            return Err(Error::Config("waits must be positive".into()));
        }
        Ok(())
    }
}

/// Heater parameters for the heated-regulation reservoir variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeaterConfig {
    /// Intermediate temperature the heater holds.
    pub hold_temperature: f64,
    /// Hysteresis band around `hold_temperature`.
    pub hold_band: f64,
    /// Independent safety-thermometer limit; at/above it the heater output
    /// is forced off immediately.
    pub safety_limit: f64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            hold_temperature: -80.0,
            hold_band: 2.0,
            safety_limit: 60.0,
        }
    }
}

impl HeaterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hold_band <= 0.0 {
            return Err(Error::Config("hold_band must be positive".into()));
        }
        if self.safety_limit <= self.hold_temperature + self.hold_band {
            return Err(Error::Config(
                "safety_limit must lie above the regulation band".into(),
            ));
        }
        Ok(())
    }
}

/// Whole-stand configuration snapshot handled by the persistence port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandConfig {
    pub manifold: VacuumThresholds,
    pub reservoir: CryoThresholds,
    pub heater: HeaterConfig,
    pub flow: FlowLoopParams,
    /// Target modes restored at startup.
    pub initial_manifold_target: ManifoldTarget,
    pub initial_reservoir_target: CryoTarget,
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            manifold: VacuumThresholds::default(),
            reservoir: CryoThresholds::default(),
            heater: HeaterConfig::default(),
            flow: FlowLoopParams::default(),
            initial_manifold_target: ManifoldTarget::Standby,
            initial_reservoir_target: CryoTarget::Standby,
        }
    }
}
