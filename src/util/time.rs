//! Time utilities for the match loop

use std::time::{Duration, Instant};

/// Tick rate configuration
pub const DEFAULT_TICK_RATE: u32 = 30; // 30 ticks per second

/// Fixed period between two steps of a match running at `tick_rate` Hz
pub fn tick_duration(tick_rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / tick_rate.max(1) as u64)
}

/// Nominal delta time for one tick (in seconds)
pub fn tick_delta(tick_rate: u32) -> f32 {
    1.0 / tick_rate.max(1) as f32
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_duration_matches_rate() {
        assert_eq!(tick_duration(30), Duration::from_micros(33_333));
        assert_eq!(tick_duration(0), Duration::from_secs(1));
        approx::assert_abs_diff_eq!(tick_delta(30), 1.0 / 30.0);
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.elapsed() >= Duration::from_millis(2));
    }
}
