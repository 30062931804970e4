//! Simulated bench hardware.
//!
//! In-memory adapters implementing the port traits, used by the demo
//! binary and the integration tests. They model just enough behaviour to
//! exercise the controllers: optional confirmation latency, a stuck-fault
//! injection on valves, and command counters so tests can assert exactly
//! what was (and was not) commanded.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::StandConfig;
use crate::error::Result;
use crate::ports::{
    AlertSink, ConfigStore, Gauge, ProportionalValve, ProtectedGauge, Pump, Severity, Valve,
};

// ───────────────────────────────────────────────────────────────
// Valves
// ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct ValveCore {
    open: bool,
    trickling: bool,
    stuck: bool,
}

/// Simulated isolation valve. Starts closed.
pub struct SimValve {
    name: String,
    core: Mutex<ValveCore>,
    latency: Option<Duration>,
    trickle_capable: bool,
    open_commands: AtomicU32,
    close_commands: AtomicU32,
}

impl SimValve {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            core: Mutex::new(ValveCore::default()),
            latency: None,
            trickle_capable: false,
            open_commands: AtomicU32::new(0),
            close_commands: AtomicU32::new(0),
        }
    }

    /// Confirmation latency on blocking waits.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    #[must_use]
    pub fn with_trickle(mut self) -> Self {
        self.trickle_capable = true;
        self
    }

    /// Inject or clear a stuck fault: commands are counted but the valve
    /// never moves, and waits report failure.
    pub fn set_stuck(&self, stuck: bool) {
        self.core.lock().unwrap().stuck = stuck;
    }

    pub fn open_commands(&self) -> u32 {
        self.open_commands.load(Ordering::Relaxed)
    }

    pub fn close_commands(&self) -> u32 {
        self.close_commands.load(Ordering::Relaxed)
    }

    pub fn command_count(&self) -> u32 {
        self.open_commands() + self.close_commands()
    }

    pub fn is_trickling(&self) -> bool {
        self.core.lock().unwrap().trickling
    }

    /// Force the position directly (test setup).
    pub fn force(&self, open: bool) {
        let mut core = self.core.lock().unwrap();
        core.open = open;
        core.trickling = false;
    }

    fn command(&self, open: bool) -> bool {
        let counter = if open {
            &self.open_commands
        } else {
            &self.close_commands
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let mut core = self.core.lock().unwrap();
        if core.stuck {
            return false;
        }
        core.open = open;
        core.trickling = false;
        true
    }
}

impl Valve for SimValve {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) {
        let _ = self.command(true);
    }

    fn close(&self) {
        let _ = self.command(false);
    }

    fn open_wait(&self, timeout: Duration) -> bool {
        if let Some(latency) = self.latency {
            if latency > timeout {
                self.open_commands.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            thread::sleep(latency);
        }
        self.command(true)
    }

    fn close_wait(&self, timeout: Duration) -> bool {
        if let Some(latency) = self.latency {
            if latency > timeout {
                self.close_commands.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            thread::sleep(latency);
        }
        self.command(false)
    }

    fn is_open(&self) -> bool {
        self.core.lock().unwrap().open
    }

    fn supports_trickle(&self) -> bool {
        self.trickle_capable
    }

    fn trickle(&self) {
        let mut core = self.core.lock().unwrap();
        if core.stuck {
            return;
        }
        core.open = true;
        core.trickling = true;
    }
}

/// Simulated proportional valve with a position in actuator steps.
pub struct SimProportionalValve {
    name: String,
    position: Mutex<f64>,
    span: (f64, f64),
    move_commands: AtomicU32,
}

impl SimProportionalValve {
    pub fn new(name: impl Into<String>, span: (f64, f64)) -> Self {
        Self {
            name: name.into(),
            position: Mutex::new(span.0),
            span,
            move_commands: AtomicU32::new(0),
        }
    }

    pub fn move_commands(&self) -> u32 {
        self.move_commands.load(Ordering::Relaxed)
    }

    pub fn set_position(&self, position: f64) {
        *self.position.lock().unwrap() = position.clamp(self.span.0, self.span.1);
    }
}

impl Valve for SimProportionalValve {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) {
        *self.position.lock().unwrap() = self.span.1;
    }

    fn close(&self) {
        *self.position.lock().unwrap() = self.span.0;
    }

    fn open_wait(&self, _timeout: Duration) -> bool {
        self.open();
        true
    }

    fn close_wait(&self, _timeout: Duration) -> bool {
        self.close();
        true
    }

    fn is_open(&self) -> bool {
        *self.position.lock().unwrap() > self.span.0
    }
}

impl ProportionalValve for SimProportionalValve {
    fn position(&self) -> f64 {
        *self.position.lock().unwrap()
    }

    fn span(&self) -> (f64, f64) {
        self.span
    }

    fn move_relative(&self, steps: f64, _timeout: Duration) -> bool {
        self.move_commands.fetch_add(1, Ordering::Relaxed);
        let mut position = self.position.lock().unwrap();
        *position = (*position + steps).clamp(self.span.0, self.span.1);
        true
    }
}

// ───────────────────────────────────────────────────────────────
// Pumps
// ───────────────────────────────────────────────────────────────

/// Simulated on/off actuator.
pub struct SimPump {
    name: String,
    on: AtomicBool,
    on_commands: AtomicU32,
    off_commands: AtomicU32,
}

impl SimPump {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on: AtomicBool::new(false),
            on_commands: AtomicU32::new(0),
            off_commands: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn running(name: impl Into<String>) -> Self {
        let pump = Self::new(name);
        pump.on.store(true, Ordering::Relaxed);
        pump
    }

    pub fn command_count(&self) -> u32 {
        self.on_commands.load(Ordering::Relaxed) + self.off_commands.load(Ordering::Relaxed)
    }
}

impl Pump for SimPump {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    fn turn_on(&self) {
        self.on_commands.fetch_add(1, Ordering::Relaxed);
        self.on.store(true, Ordering::Relaxed);
    }

    fn turn_off(&self) {
        self.off_commands.fetch_add(1, Ordering::Relaxed);
        self.on.store(false, Ordering::Relaxed);
    }
}

// ───────────────────────────────────────────────────────────────
// Gauges
// ───────────────────────────────────────────────────────────────

/// Simulated scalar sensor with settable value and rate.
pub struct SimGauge {
    name: String,
    reading: Mutex<(f64, f64)>,
}

impl SimGauge {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            reading: Mutex::new((value, 0.0)),
        }
    }

    pub fn set_value(&self, value: f64) {
        self.reading.lock().unwrap().0 = value;
    }

    pub fn set(&self, value: f64, rate: f64) {
        *self.reading.lock().unwrap() = (value, rate);
    }
}

impl Gauge for SimGauge {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> f64 {
        self.reading.lock().unwrap().0
    }

    fn rate(&self) -> f64 {
        self.reading.lock().unwrap().1
    }
}

/// Simulated poor-vacuum-intolerant head with an energize control.
pub struct SimProtectedGauge {
    inner: SimGauge,
    energized: AtomicBool,
    energize_commands: AtomicU32,
}

impl SimProtectedGauge {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            inner: SimGauge::new(name, value),
            energized: AtomicBool::new(false),
            energize_commands: AtomicU32::new(0),
        }
    }

    pub fn set_value(&self, value: f64) {
        self.inner.set_value(value);
    }

    pub fn energize_commands(&self) -> u32 {
        self.energize_commands.load(Ordering::Relaxed)
    }
}

impl Gauge for SimProtectedGauge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn value(&self) -> f64 {
        self.inner.value()
    }

    fn rate(&self) -> f64 {
        self.inner.rate()
    }
}

impl ProtectedGauge for SimProtectedGauge {
    fn set_energized(&self, on: bool) {
        self.energize_commands.fetch_add(1, Ordering::Relaxed);
        self.energized.store(on, Ordering::Relaxed);
    }

    fn is_energized(&self) -> bool {
        self.energized.load(Ordering::Relaxed)
    }
}

// ───────────────────────────────────────────────────────────────
// Alert sink and config store
// ───────────────────────────────────────────────────────────────

/// One captured alert.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub severity: Severity,
    pub source: String,
    pub message: String,
}

/// Collects alerts for assertion in tests.
#[derive(Default)]
pub struct MemoryAlertSink {
    records: Mutex<Vec<AlertRecord>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AlertRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn count_at_least(&self, severity: Severity) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.severity >= severity)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, severity: Severity, source: &str, message: &str) {
        self.records.lock().unwrap().push(AlertRecord {
            severity,
            source: source.to_owned(),
            message: message.to_owned(),
        });
    }
}

/// In-memory configuration store seeded with defaults.
pub struct MemoryConfigStore {
    config: Mutex<StandConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: StandConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new(StandConfig::default())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<StandConfig> {
        Ok(self.config.lock().unwrap().clone())
    }

    fn save(&self, config: &StandConfig) -> Result<()> {
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }
}
