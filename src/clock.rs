//! Monotonic tick source for call timing
//!
//! The aggregation logic only ever consumes tick *deltas*, so the unit
//! is opaque: the production clock reports nanoseconds elapsed since
//! construction, tests inject a manually-advanced clock to get
//! deterministic durations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic ticks consumed by the engine.
pub trait Clock: Send + Sync {
    /// Current tick value. Must be monotonically non-decreasing.
    fn now(&self) -> u64;
}

/// Production clock: nanoseconds since the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Test clock advanced explicitly by the caller.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Advance the clock by `delta` ticks.
    pub fn advance(&self, delta: u64) {
        self.ticks.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
