//! Runtime clocks used to measure operator cost.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Millisecond clock.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since an arbitrary origin.
    fn now_ms(&self) -> f64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Starts the clock.
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
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Deterministic clock advancing by a fixed step on every read.
#[derive(Debug)]
pub struct StepClock {
    step_ms: f64,
    ticks: AtomicU64,
}

impl StepClock {
    /// Clock whose consecutive reads differ by `step_ms`.
    pub fn new(step_ms: f64) -> Self {
        Self {
            step_ms,
            ticks: AtomicU64::new(0),
        }
    }
}

impl Clock for StepClock {
    fn now_ms(&self) -> f64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) as f64 * self.step_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_clock_advances_per_read() {
        let clock = StepClock::new(0.5);
        assert_eq!(clock.now_ms(), 0.0);
        assert_eq!(clock.now_ms(), 0.5);
        assert_eq!(clock.now_ms(), 1.0);
    }
}
