//! Tick source abstraction (spec §6's external collaborator: "a timer
//! facility driving sync/secure ticks"). `SystemClock` drives the `cbe`
//! binary against the wall clock; `ManualClock` lets tests advance time
//! deterministically.

use std::time::{Duration, Instant};

pub trait TickSource {
    /// Monotonic tick counter used to timestamp cache-slot LRU order
    /// and translation walks; unrelated to wall-clock sync/secure
    /// cadence.
    fn now(&self) -> u64;

    /// Milliseconds elapsed since this source was created or last reset.
    fn elapsed_ms(&self) -> u64;
}

pub struct SystemClock {
    start: Instant,
    ticks: std::cell::Cell<u64>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            ticks: std::cell::Cell::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemClock {
    fn now(&self) -> u64 {
        let t = self.ticks.get();
        self.ticks.set(t + 1);
        t
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A clock tests advance explicitly, so sync/secure timer behavior is
/// reproducible without sleeping.
pub struct ManualClock {
    ticks: std::cell::Cell<u64>,
    elapsed: std::cell::Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            ticks: std::cell::Cell::new(0),
            elapsed: std::cell::Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for ManualClock {
    fn now(&self) -> u64 {
        let t = self.ticks.get();
        self.ticks.set(t + 1);
        t
    }

    fn elapsed_ms(&self) -> u64 {
        self.elapsed.get().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_advances_on_request() {
        let clock = ManualClock::new();
        assert_eq!(clock.elapsed_ms(), 0);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.elapsed_ms(), 250);
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.now(), 1);
    }
}
