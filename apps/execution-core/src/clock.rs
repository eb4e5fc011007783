//! Clock port — the sole source of time in the core.
//!
//! Every component reads time through this trait so that backtests can
//! advance a simulated clock deterministically. Reading the wall clock
//! anywhere else breaks replay determinism.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current timezone-aware timestamp in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation for live and paper trading.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for backtests and tests.
#[derive(Debug)]
pub struct SimulatedClock {
    current: Mutex<DateTime<Utc>>,
}

impl SimulatedClock {
    /// Create a simulated clock starting at the given instant.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.current.lock() {
            *current += by;
        }
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut current) = self.current.lock() {
            *current = to;
        }
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        self.current.lock().map_or_else(|e| *e.into_inner(), |t| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        "2026-03-02T14:30:00Z".parse().unwrap()
    }

    #[test]
    fn simulated_clock_holds_time() {
        let clock = SimulatedClock::new(start());
        assert_eq!(clock.now(), start());
        assert_eq!(clock.now(), start());
    }

    #[test]
    fn simulated_clock_advances() {
        let clock = SimulatedClock::new(start());
        clock.advance(Duration::seconds(91));
        assert_eq!(clock.now(), start() + Duration::seconds(91));
    }

    #[test]
    fn simulated_clock_set_jumps() {
        let clock = SimulatedClock::new(start());
        let later = start() + Duration::hours(2);
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
