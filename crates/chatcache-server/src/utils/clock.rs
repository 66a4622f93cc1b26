use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

/// Time source shared by services and the in-memory backend
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for simulating elapsed windows in tests
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Mutex::new(start) }
    }

    /// Fixed, arbitrary starting instant (2026-01-01T00:00:00Z)
    pub fn starting_at_epoch_2026() -> Self {
        let start = Utc
            .timestamp_millis_opt(1_767_225_600_000)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(start)
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.current.lock();
        *guard += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at_epoch_2026();
        let start = clock.now_millis();
        clock.advance(Duration::minutes(31));
        assert_eq!(clock.now_millis() - start, 31 * 60 * 1000);
    }
}
