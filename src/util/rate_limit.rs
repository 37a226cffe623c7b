//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified events per second
pub fn create_limiter(per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Default number of script log lines a robot may emit per second
pub const SCRIPT_LOG_RATE_LIMIT: u32 = 20;

/// Per-robot log sink limiter
#[derive(Clone)]
pub struct LogRateLimiter {
    limiter: Arc<Limiter>,
    dropped: u64,
}

impl LogRateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            limiter: create_limiter(per_second),
            dropped: 0,
        }
    }

    /// Check if a log line may be forwarded (returns true if allowed)
    pub fn check(&mut self) -> bool {
        if self.limiter.check().is_ok() {
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    /// Return and reset the rejected line count
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

impl Default for LogRateLimiter {
    fn default() -> Self {
        Self::new(SCRIPT_LOG_RATE_LIMIT)
    }
}
