//! Port traits: the hexagonal boundary between the supervision core and the
//! device layer.
//!
//! ```text
//!   Adapter (serial/TCP protocol driver) ──▶ Port trait ──▶ Controller
//! ```
//!
//! Driven adapters (valve controllers, pump controllers, gauge heads, alert
//! routing, config persistence) implement these traits. The controllers
//! consume them as `Arc<dyn …>` handles, so the core never touches wire
//! protocols directly.
//!
//! Ownership discipline: each actuator handle is **commanded by exactly one
//! controller**. Other parties may read (`is_open`, `position`) but must
//! route commands through that controller's public operations.
//!
//! All blocking waits take a maximum duration and return `bool`: `false`
//! means "not confirmed in time", never a hang and never an error. Callers
//! choose retry, escalate, or abandon.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::StandConfig;
use crate::error::Result;

// ───────────────────────────────────────────────────────────────
// Valves
// ───────────────────────────────────────────────────────────────

/// An isolation valve (open/closed).
///
/// Methods take `&self`; adapters carry their own interior synchronisation
/// since the commanding controller and state queries live on different
/// threads.
pub trait Valve: Send + Sync {
    /// Identifier used in logs and alerts.
    fn name(&self) -> &str;

    /// Command open without waiting for confirmation.
    fn open(&self);

    /// Command closed without waiting for confirmation.
    fn close(&self);

    /// Command open and block until the position is confirmed or `timeout`
    /// elapses. `false` = not confirmed in time.
    fn open_wait(&self, timeout: Duration) -> bool;

    /// Command closed and block until confirmed or `timeout` elapses.
    fn close_wait(&self, timeout: Duration) -> bool;

    fn is_open(&self) -> bool;

    fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Whether the valve supports a reduced sustained "trickle" opening.
    fn supports_trickle(&self) -> bool {
        false
    }

    /// Switch to the reduced sustained opening. Only meaningful when
    /// [`supports_trickle`](Valve::supports_trickle) is true; the default
    /// falls back to a plain open.
    fn trickle(&self) {
        self.open();
    }
}

/// Travel limits of a proportional valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveLimit {
    FullyOpen,
    FullyClosed,
}

/// A motorised proportional valve with a numeric position.
pub trait ProportionalValve: Valve {
    /// Current position in actuator steps.
    fn position(&self) -> f64;

    /// (closed, open) position bounds in actuator steps.
    fn span(&self) -> (f64, f64);

    /// Issue a single incremental relative move and block until the motion
    /// completes or `timeout` elapses. `false` = not confirmed in time.
    fn move_relative(&self, steps: f64, timeout: Duration) -> bool;

    /// Which travel limit the valve currently sits at, if any.
    fn at_limit(&self) -> Option<ValveLimit> {
        let (closed, open) = self.span();
        let pos = self.position();
        if pos <= closed {
            Some(ValveLimit::FullyClosed)
        } else if pos >= open {
            Some(ValveLimit::FullyOpen)
        } else {
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Pumps and other on/off actuators
// ───────────────────────────────────────────────────────────────

/// An on/off actuator: roughing pump, warming circuit, heater output.
pub trait Pump: Send + Sync {
    fn name(&self) -> &str;

    fn is_on(&self) -> bool;

    fn is_off(&self) -> bool {
        !self.is_on()
    }

    fn turn_on(&self);

    fn turn_off(&self);
}

// ───────────────────────────────────────────────────────────────
// Gauges / sensors
// ───────────────────────────────────────────────────────────────

/// A scalar process sensor: pressure gauge, level thermometer.
pub trait Gauge: Send + Sync {
    fn name(&self) -> &str;

    /// Current reading in the gauge's native unit.
    fn value(&self) -> f64;

    /// Rate of change in units per second.
    fn rate(&self) -> f64;

    /// |rate| within `band`.
    fn is_stable(&self, band: f64) -> bool {
        self.rate().abs() <= band
    }

    fn is_rising(&self, band: f64) -> bool {
        self.rate() > band
    }

    fn is_falling(&self, band: f64) -> bool {
        self.rate() < -band
    }
}

/// A gauge whose sensing element is damaged by operation outside its safe
/// range (e.g. a cold-cathode head exposed to rough vacuum) and therefore
/// carries an energize/de-energize control.
pub trait ProtectedGauge: Gauge {
    /// Energize or de-energize the sensing element.
    fn set_energized(&self, on: bool);

    fn is_energized(&self) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Alert sink
// ───────────────────────────────────────────────────────────────

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// A control loop has terminated and will not recover on its own.
    Fatal,
}

/// Fire-and-forget operator notification channel. Message formatting and
/// routing are the adapter's concern.
pub trait AlertSink: Send + Sync {
    fn raise(&self, severity: Severity, source: &str, message: &str);
}

/// Routes alerts to the `log` facade. The default sink for bench use.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, severity: Severity, source: &str, message: &str) {
        match severity {
            Severity::Info => log::info!("[{source}] {message}"),
            Severity::Warning => log::warn!("[{source}] {message}"),
            Severity::Error | Severity::Fatal => log::error!("[{source}] {message}"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Configuration persistence
// ───────────────────────────────────────────────────────────────

/// Loads and persists the stand configuration (initial targets and
/// thresholds). The core owns no file format; adapters decide.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<StandConfig>;

    fn save(&self, config: &StandConfig) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGauge(f64, f64);
    impl Gauge for FixedGauge {
        fn name(&self) -> &str {
            "fixed"
        }
        fn value(&self) -> f64 {
            self.0
        }
        fn rate(&self) -> f64 {
            self.1
        }
    }

    #[test]
    fn gauge_rate_predicates() {
        let falling = FixedGauge(1.0, -0.5);
        assert!(falling.is_falling(0.1));
        assert!(!falling.is_rising(0.1));
        assert!(!falling.is_stable(0.1));

        let steady = FixedGauge(1.0, 0.05);
        assert!(steady.is_stable(0.1));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Fatal > Severity::Error);
        assert!(Severity::Warning > Severity::Info);
    }
}
