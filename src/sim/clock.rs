use crate::store::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// Часы, которые двигает тест
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 06.01.2025 09:00:00 UTC
        Self::new(DateTime::from_timestamp(1_736_154_000, 0).unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
