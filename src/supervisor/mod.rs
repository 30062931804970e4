//! Generic state-supervision engine.
//!
//! A controller is split into a declarative **target state** (externally
//! settable), a pure **observed state** derivation (owned by the concrete
//! controller, not this engine), and a [`Program`] that performs one bounded
//! unit of hardware interaction per tick. The engine owns the scheduling:
//!
//! ```text
//!  set_target / nudge ──▶ ┌──────────────────────────────┐
//!                         │  Supervisor                  │
//!                         │  dedicated thread            │
//!                         │  ┌────────────────────────┐  │
//!                         │  │ loop:                  │  │
//!                         │  │   detect target change │  │
//!                         │  │   program.tick()       │  │
//!                         │  │   watchdog bookkeeping │  │
//!                         │  │   wait (poll ∨ wake)   │  │
//!                         │  └────────────────────────┘  │
//!                         └──────────────────────────────┘
//! ```
//!
//! The loop wakes on a bounded timeout **or** immediately on a configuration
//! change; it never busy-waits. Each supervisor thread is the sole writer of
//! its program's actuators; independent supervisors on disjoint actuators
//! proceed concurrently.
//!
//! Failure semantics: a `Tick` timeout is the program's business (retry next
//! tick). An `Err` from [`Program::tick`] is fatal: the engine raises a
//! `Fatal` alert and terminates the loop permanently without issuing further
//! commands (fail-stop: continuing with an unverified valve configuration is
//! the hazard).

pub mod watchdog;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::error::{Error, Result};
use crate::ports::{AlertSink, Severity};
use watchdog::StallWatchdog;

// ───────────────────────────────────────────────────────────────
// Program contract
// ───────────────────────────────────────────────────────────────

/// What a tick accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick<T> {
    /// The target's terminal condition holds; nothing to do until inputs
    /// change. Repeated ticks are no-ops.
    Converged,
    /// A command was issued or forward progress was independently observed;
    /// the stall watchdog restarts.
    Progress,
    /// Still transitional with no observable progress; the stall watchdog
    /// keeps accumulating.
    Pending,
    /// The program requests a self-transition (e.g. Thaw completing into
    /// Standby). Routed through the normal target-change path so hooks fire.
    Transition(T),
}

/// Action the engine asks the program to perform on an orderly stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopAction {
    /// Drive owned actuators to their de-energised state.
    #[default]
    TurnOff,
    /// Leave actuators energised in their parked configuration.
    TurnOn,
    /// Leave hardware exactly as-is.
    None,
}

/// The per-controller control program executed by a [`Supervisor`].
///
/// `tick` must be safe to call repeatedly, perform at most one bounded
/// hardware interaction, and be a no-op once converged.
pub trait Program: Send + 'static {
    type Target: Copy + PartialEq + fmt::Debug + Send + 'static;

    /// Identifier used in thread names, logs, and alerts.
    fn name(&self) -> &str;

    /// One bounded unit of work toward `target`.
    fn tick(&mut self, target: Self::Target) -> Result<Tick<Self::Target>>;

    /// Hook run in the loop when the target changes (including the initial
    /// target on startup, with `from = None`). `from` is the last target
    /// the loop actually observed; one replaced before the first tick is
    /// never reported. Progress timers have already been reset when this
    /// runs.
    fn target_changed(&mut self, _from: Option<Self::Target>, _to: Self::Target) {}

    /// Perform the configured stop action. Runs exactly once, as the loop's
    /// final hardware interaction.
    fn shutdown(&mut self, action: StopAction);

    /// Watchdog limit for a transitional target; `None` disarms.
    fn stall_limit(&self, _target: Self::Target) -> Option<Duration> {
        None
    }

    /// Escalation for a stalled transitional target. Fired at most once per
    /// elapsed watchdog period.
    fn escalate_stall(&mut self, _target: Self::Target) {}

    /// Bounded interval between unprompted ticks.
    fn poll_interval(&self) -> Duration;
}

// ───────────────────────────────────────────────────────────────
// Shared wake cell
// ───────────────────────────────────────────────────────────────

struct Cell<T> {
    target: T,
    generation: u64,
    stop: bool,
}

struct Shared<T> {
    cell: Mutex<Cell<T>>,
    wake: Condvar,
    stopped: AtomicBool,
}

impl<T: Copy> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Cell<T>> {
        // A poisoned cell only means another thread panicked mid-update of
        // plain values; recover and keep the loop deterministic.
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> (T, u64, bool) {
        let cell = self.lock();
        (cell.target, cell.generation, cell.stop)
    }

    /// Block until the generation moves past `seen`, stop is requested, or
    /// `timeout` elapses.
    fn wait(&self, seen: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut cell = self.lock();
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

// ───────────────────────────────────────────────────────────────
// Supervisor
// ───────────────────────────────────────────────────────────────

/// Owns one control program and the dedicated thread that runs it.
pub struct Supervisor<T: Copy + PartialEq + fmt::Debug + Send + 'static> {
    name: String,
    shared: Arc<Shared<T>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<T: Copy + PartialEq + fmt::Debug + Send + 'static> Supervisor<T> {
    /// Spawn the control loop with `initial` as the starting target.
    pub fn start<P>(
        initial: T,
        stop_action: StopAction,
        program: P,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self>
    where
        P: Program<Target = T>,
    {
        let name = program.name().to_owned();
        let shared = Arc::new(Shared {
            cell: Mutex::new(Cell {
                target: initial,
                generation: 0,
                stop: false,
            }),
            wake: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(&loop_shared, program, stop_action, &alerts))
            .map_err(|e| Error::ControlLoop(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            name,
            shared,
            thread: Some(thread),
        })
    }

    /// Update the target state and wake the loop immediately.
    ///
    /// Setting the current target again is a no-op: no wake, no watchdog
    /// reset, no re-issued commands.
    pub fn set_target(&self, target: T) {
        let mut cell = self.shared.lock();
        if cell.target == target {
            return;
        }
        cell.target = target;
        cell.generation += 1;
        drop(cell);
        self.shared.wake.notify_all();
    }

    /// Current target state.
    pub fn target(&self) -> T {
        self.shared.lock().target
    }

    /// Wake the loop without changing the target (threshold mutation).
    pub fn nudge(&self) {
        let mut cell = self.shared.lock();
        cell.generation += 1;
        drop(cell);
        self.shared.wake.notify_all();
    }

    /// Signal the loop to stop and block until it has terminated. The stop
    /// action runs exactly once; afterwards no actuator command is issued.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        {
            let mut cell = self.shared.lock();
            cell.stop = true;
        }
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            error!("{}: control thread panicked during shutdown", self.name);
            self.shared.stopped.store(true, Ordering::Release);
        }
    }

    /// Whether the control loop has terminated (orderly stop or fail-stop).
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl<T: Copy + PartialEq + fmt::Debug + Send + 'static> Drop for Supervisor<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ───────────────────────────────────────────────────────────────
// Loop body
// ───────────────────────────────────────────────────────────────

fn run_loop<P: Program>(
    shared: &Shared<P::Target>,
    mut program: P,
    stop_action: StopAction,
    alerts: &Arc<dyn AlertSink>,
) {
    let mut last: Option<P::Target> = None;
    let mut dog = StallWatchdog::disarmed(Instant::now());

    loop {
        let (target, generation, stop) = shared.snapshot();

        if stop {
            info!("{}: stop requested, stop action {:?}", program.name(), stop_action);
            program.shutdown(stop_action);
            break;
        }

        if last != Some(target) {
            info!("{}: target {:?} -> {:?}", program.name(), last, target);
            dog.rearm(program.stall_limit(target), Instant::now());
            program.target_changed(last, target);
            last = Some(target);
        }

        match program.tick(target) {
            Ok(Tick::Converged | Tick::Progress) => {
                dog.note_progress(Instant::now());
            }
            Ok(Tick::Pending) => {
                let now = Instant::now();
                if dog.check(now) {
                    warn!("{}: stalled in {:?}, escalating", program.name(), target);
                    program.escalate_stall(target);
                }
            }
            Ok(Tick::Transition(next)) => {
                let mut cell = shared.lock();
                // Only honour the request if no external change raced it.
                if cell.target == target {
                    cell.target = next;
                    cell.generation += 1;
                }
                continue;
            }
            Err(e) => {
                error!("{}: control loop terminated: {e}", program.name());
                alerts.raise(
                    Severity::Fatal,
                    program.name(),
                    &format!("control loop terminated: {e}"),
                );
                break;
            }
        }

        shared.wait(generation, program.poll_interval());
    }

    shared.stopped.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Changed(Option<u8>, u8),
        Tick(u8),
        Shutdown(StopAction),
    }

    #[derive(Clone, Default)]
    struct Script {
        calls: Arc<StdMutex<Vec<Call>>>,
        fail_on_tick: Arc<AtomicBool>,
    }

    impl Script {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Program for Script {
        type Target = u8;

        fn name(&self) -> &str {
            "script"
        }

        fn tick(&mut self, target: u8) -> Result<Tick<u8>> {
            self.calls.lock().unwrap().push(Call::Tick(target));
            if self.fail_on_tick.load(Ordering::Relaxed) {
                return Err(Error::ControlLoop("scripted failure".into()));
            }
            // Target 7 requests a self-transition to 0.
            if target == 7 {
                return Ok(Tick::Transition(0));
            }
            Ok(Tick::Converged)
        }

        fn target_changed(&mut self, from: Option<u8>, to: u8) {
            self.calls.lock().unwrap().push(Call::Changed(from, to));
        }

        fn shutdown(&mut self, action: StopAction) {
            self.calls.lock().unwrap().push(Call::Shutdown(action));
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    fn sink() -> Arc<dyn AlertSink> {
        Arc::new(crate::ports::LogAlertSink)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn initial_target_fires_changed_hook_once() {
        let script = Script::default();
        let probe = script.clone();
        let mut sup = Supervisor::start(3u8, StopAction::None, script, sink()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            probe.calls().contains(&Call::Tick(3))
        }));
        sup.stop();
        let changed: Vec<_> = probe
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Changed(..)))
            .collect();
        assert_eq!(changed, vec![Call::Changed(None, 3)]);
    }

    #[test]
    fn redundant_set_target_is_a_no_op() {
        let script = Script::default();
        let probe = script.clone();
        let mut sup = Supervisor::start(3u8, StopAction::None, script, sink()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            !probe.calls().is_empty()
        }));
        sup.set_target(3);
        sup.set_target(3);
        sup.stop();
        let changed: Vec<_> = probe
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Changed(..)))
            .collect();
        assert_eq!(changed.len(), 1, "no hook on redundant target set");
    }

    #[test]
    fn target_change_wakes_and_fires_hook() {
        let script = Script::default();
        let probe = script.clone();
        let mut sup = Supervisor::start(1u8, StopAction::None, script, sink()).unwrap();
        // `from` is the loop's last-observed target, so the loop must see
        // the initial target before the switch lands.
        assert!(wait_until(Duration::from_secs(1), || {
            probe.calls().contains(&Call::Tick(1))
        }));
        sup.set_target(2);
        assert!(wait_until(Duration::from_secs(1), || {
            probe.calls().contains(&Call::Changed(Some(1), 2))
        }));
        sup.stop();
    }

    #[test]
    fn self_transition_routes_through_hooks() {
        let script = Script::default();
        let probe = script.clone();
        let mut sup = Supervisor::start(7u8, StopAction::None, script, sink()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            probe.calls().contains(&Call::Changed(Some(7), 0))
        }));
        assert_eq!(sup.target(), 0);
        sup.stop();
    }

    #[test]
    fn stop_runs_stop_action_exactly_once_and_reports() {
        let script = Script::default();
        let probe = script.clone();
        let mut sup = Supervisor::start(1u8, StopAction::TurnOff, script, sink()).unwrap();
        sup.stop();
        assert!(sup.is_stopped());
        let shutdowns: Vec<_> = probe
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Shutdown(_)))
            .collect();
        assert_eq!(shutdowns, vec![Call::Shutdown(StopAction::TurnOff)]);
        // Second stop is inert.
        sup.stop();
        let after: Vec<_> = probe
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Shutdown(_)))
            .collect();
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn tick_error_fail_stops_without_stop_action() {
        let script = Script::default();
        let probe = script.clone();
        script.fail_on_tick.store(true, Ordering::Relaxed);
        let mut sup = Supervisor::start(1u8, StopAction::TurnOff, script, sink()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || sup.is_stopped()));
        let calls = probe.calls();
        assert!(
            !calls.iter().any(|c| matches!(c, Call::Shutdown(_))),
            "fail-stop must not command hardware"
        );
        sup.stop();
    }

    #[test]
    fn no_ticks_after_stop() {
        let script = Script::default();
        let probe = script.clone();
        let mut sup = Supervisor::start(1u8, StopAction::None, script, sink()).unwrap();
        sup.stop();
        let count = probe.calls().len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(probe.calls().len(), count);
    }
}
