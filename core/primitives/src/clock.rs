use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::Slot;

/// Wall-clock source. The real variant reads the system clock; the fake
/// variant is driven manually by tests.
#[derive(Clone)]
pub struct Clock(ClockInner);

#[derive(Clone)]
enum ClockInner {
    Real,
    Fake(Arc<Mutex<Duration>>),
}

impl Clock {
    pub fn real() -> Self {
        Clock(ClockInner::Real)
    }

    /// Time since the unix epoch.
    pub fn now(&self) -> Duration {
        match &self.0 {
            ClockInner::Real => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before unix epoch"),
            ClockInner::Fake(now) => *now.lock(),
        }
    }
}

/// Manually driven clock for tests. Cloned `Clock` handles observe every
/// `advance`/`set`.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Duration>>,
}

impl FakeClock {
    pub fn new(now: Duration) -> Self {
        FakeClock { now: Arc::new(Mutex::new(now)) }
    }

    pub fn clock(&self) -> Clock {
        Clock(ClockInner::Fake(self.now.clone()))
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock() = now;
    }
}

/// Maps wall-clock time onto the slot grid.
#[derive(Clone, Copy, Debug)]
pub struct SlotClock {
    /// Wall-clock time of slot 0, since the unix epoch.
    pub genesis: Duration,
    pub slot_duration: Duration,
}

impl SlotClock {
    pub fn slot_at(&self, now: Duration) -> Slot {
        if now <= self.genesis {
            return 0;
        }
        ((now - self.genesis).as_nanos() / self.slot_duration.as_nanos()) as Slot
    }

    pub fn current_slot(&self, clock: &Clock) -> Slot {
        self.slot_at(clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_drives_slots() {
        let fake = FakeClock::new(Duration::from_secs(100));
        let clock = fake.clock();
        let slots = SlotClock {
            genesis: Duration::from_secs(100),
            slot_duration: Duration::from_secs(2),
        };
        assert_eq!(slots.current_slot(&clock), 0);
        fake.advance(Duration::from_secs(5));
        assert_eq!(slots.current_slot(&clock), 2);
        fake.set(Duration::from_secs(130));
        assert_eq!(slots.current_slot(&clock), 15);
    }

    #[test]
    fn before_genesis_is_slot_zero() {
        let slots = SlotClock {
            genesis: Duration::from_secs(100),
            slot_duration: Duration::from_secs(1),
        };
        assert_eq!(slots.slot_at(Duration::from_secs(7)), 0);
    }
}
