//! Stall watchdog for transitional supervisor states.
//!
//! While a controller sits in a transitional (non-terminal) state, elapsed
//! time accumulates here. If it exceeds the configured limit before the
//! terminal condition is reached, [`StallWatchdog::check`] reports exactly
//! one escalation and restarts the timer, so subsequent ticks do not flood
//! the escalation path. The timer also restarts whenever forward progress is
//! observed or the target changes.
//!
//! All methods take an explicit `Instant` so tests drive time synthetically.

use std::time::{Duration, Instant};

/// Per-transitional-state elapsed-time tracker.
#[derive(Debug)]
pub struct StallWatchdog {
    limit: Option<Duration>,
    since: Instant,
}

impl StallWatchdog {
    /// A watchdog that never fires until [`rearm`](Self::rearm)ed with a
    /// limit.
    pub fn disarmed(now: Instant) -> Self {
        Self { limit: None, since: now }
    }

    /// Arm (or disarm, with `None`) for a new target and restart the timer.
    pub fn rearm(&mut self, limit: Option<Duration>, now: Instant) {
        self.limit = limit;
        self.since = now;
    }

    /// Forward progress was observed; restart the timer.
    pub fn note_progress(&mut self, now: Instant) {
        self.since = now;
    }

    /// Returns `true` when the limit has been exceeded, at most once per
    /// elapsed period: firing restarts the timer.
    pub fn check(&mut self, now: Instant) -> bool {
        match self.limit {
            Some(limit) if now.duration_since(self.since) >= limit => {
                self.since = now;
                true
            }
            _ => false,
        }
    }

    /// Time accumulated since the last restart.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.since)
    }

    pub fn is_armed(&self) -> bool {
        self.limit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(60);

    #[test]
    fn disarmed_never_fires() {
        let t0 = Instant::now();
        let mut dog = StallWatchdog::disarmed(t0);
        assert!(!dog.check(t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn fires_once_then_restarts() {
        let t0 = Instant::now();
        let mut dog = StallWatchdog::disarmed(t0);
        dog.rearm(Some(LIMIT), t0);

        assert!(!dog.check(t0 + Duration::from_secs(59)));
        assert!(dog.check(t0 + Duration::from_secs(61)));
        // Immediately after firing the timer restarted; no flood.
        assert!(!dog.check(t0 + Duration::from_secs(62)));
        assert!(!dog.check(t0 + Duration::from_secs(100)));
        // A second full period later it may fire again.
        assert!(dog.check(t0 + Duration::from_secs(61 + 61)));
    }

    #[test]
    fn progress_restarts_timer() {
        let t0 = Instant::now();
        let mut dog = StallWatchdog::disarmed(t0);
        dog.rearm(Some(LIMIT), t0);

        dog.note_progress(t0 + Duration::from_secs(50));
        assert!(!dog.check(t0 + Duration::from_secs(100)));
        assert!(dog.check(t0 + Duration::from_secs(111)));
    }

    #[test]
    fn rearm_resets_elapsed() {
        let t0 = Instant::now();
        let mut dog = StallWatchdog::disarmed(t0);
        dog.rearm(Some(LIMIT), t0);
        let t1 = t0 + Duration::from_secs(59);
        dog.rearm(Some(LIMIT), t1);
        assert!(!dog.check(t1 + Duration::from_secs(2)));
        assert_eq!(dog.elapsed(t1 + Duration::from_secs(2)), Duration::from_secs(2));
    }
}
