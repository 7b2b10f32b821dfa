//! Wall-clock budget for one invocation of a step.
//!
//! Every loop that can do unbounded work (archive entries, SQL statements,
//! directory entries, frames of a large file) asks the budget once per item.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;

/// Source of "now" in fractional seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
    }
}

/// Deterministic clock: every call to `now` advances by `tick` seconds.
///
/// Used to script budget expiry after an exact number of checks.
#[derive(Debug)]
pub struct TickClock {
    micros: AtomicU64,
    tick_micros: u64,
}

impl TickClock {
    pub fn new(tick_secs: f64) -> Self {
        Self {
            micros: AtomicU64::new(0),
            tick_micros: (tick_secs * 1e6) as u64,
        }
    }
}

impl Clock for TickClock {
    fn now(&self) -> f64 {
        let t = self.micros.fetch_add(self.tick_micros, Ordering::SeqCst);
        t as f64 / 1e6
    }
}

/// Result of a single budget check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetCheck {
    pub elapsed: f64,
    pub exceeded: bool,
}

#[derive(Clone)]
pub struct TimeBudget {
    start: f64,
    timeout: f64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TimeBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBudget")
            .field("start", &self.start)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TimeBudget {
    /// Start a budget now, reading the clock exactly once.
    pub fn start(clock: Arc<dyn Clock>, timeout_secs: f64) -> Self {
        let start = clock.now();
        Self {
            start,
            timeout: timeout_secs,
            clock,
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self {
            start: 0.0,
            timeout: f64::INFINITY,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    pub fn exceeded_at(&self, now: f64) -> bool {
        now - self.start > self.timeout
    }

    /// Read the clock once and report elapsed time plus whether the budget is spent.
    pub fn check(&self) -> BudgetCheck {
        let now = self.clock.now();
        BudgetCheck {
            elapsed: now - self.start,
            exceeded: self.exceeded_at(now),
        }
    }

    pub fn exceeded(&self) -> bool {
        self.check().exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeded_is_strictly_greater_than_timeout() {
        let b = TimeBudget {
            start: 100.0,
            timeout: 18.0,
            clock: Arc::new(SystemClock),
        };
        assert!(!b.exceeded_at(118.0));
        assert!(b.exceeded_at(118.001));
        assert!(!b.exceeded_at(105.0));
    }

    #[test]
    fn tick_clock_expires_after_exact_number_of_checks() {
        let clock = Arc::new(TickClock::new(1.0));
        let b = TimeBudget::start(clock, 2.5);
        assert!(!b.check().exceeded); // t=1
        assert!(!b.check().exceeded); // t=2
        assert!(b.check().exceeded); // t=3
    }

    #[test]
    fn unlimited_never_expires() {
        let b = TimeBudget::unlimited();
        assert!(!b.exceeded());
    }
}
