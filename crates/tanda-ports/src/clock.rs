//! The `Clock` port (SPEC_FULL.md §6.5): all time math uses UTC; the core
//! never calls `chrono::Utc::now()` directly so deadline/reminder logic can
//! be driven deterministically under test.

use std::sync::Mutex;

use chrono::Duration;

use tanda_core::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Production adapter: the wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}

/// Test adapter: a clock that only moves when told to, so deadline-elapsed
/// and reminder-offset logic can be asserted without real sleeps.
pub struct FixedClock(Mutex<Timestamp>);

impl FixedClock {
    pub fn new(start: Timestamp) -> Self {
        Self(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().expect("fixed clock poisoned");
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.0.lock().expect("fixed clock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_only_moves_on_advance() {
        let start = chrono::Utc::now();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(24));
        assert_eq!(clock.now(), start + Duration::hours(24));
    }
}
