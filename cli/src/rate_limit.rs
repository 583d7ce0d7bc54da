//! Fixed-window request limiting for the control plane.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

/// Admits at most `limit` requests per `window`; the count resets when a
/// request arrives after the window has elapsed.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Count one request. Returns `false` if it is over the limit.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(state.started) >= self.window {
            state.started = now;
            state.used = 0;
        }
        if state.used >= self.limit {
            return false;
        }
        state.used += 1;
        true
    }

    /// Time until the current window resets.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.window
            .saturating_sub(Instant::now().saturating_duration_since(state.started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(59)));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn zero_limit_refuses_everything() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert!(!limiter.try_acquire());
    }
}
