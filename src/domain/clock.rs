use chrono::Utc;
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::sync::Arc;

use super::types::LocalTime;

/// Sole source of "now" for the scheduler; everything downstream takes the
/// tick's timestamp as an argument so a tick is internally consistent
pub trait Clock: Send + Sync {
    fn now(&self) -> LocalTime;
    fn timezone(&self) -> Tz;
}

/// Wall clock in the configured zone
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> LocalTime {
        Utc::now().with_timezone(&self.tz)
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Settable clock for tests and replay
pub struct ManualClock {
    now: RwLock<LocalTime>,
}

impl ManualClock {
    pub fn new(start: LocalTime) -> Arc<Self> {
        Arc::new(Self {
            now: RwLock::new(start),
        })
    }

    pub fn set(&self, instant: LocalTime) {
        *self.now.write() = instant;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.write();
        *now = *now + duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> LocalTime {
        *self.now.read()
    }

    fn timezone(&self) -> Tz {
        self.now.read().timezone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn manual_clock_advances() {
        let start = chrono_tz::America::Los_Angeles
            .with_ymd_and_hms(2024, 6, 21, 9, 0, 0)
            .unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), start + Duration::minutes(90));
    }
}
