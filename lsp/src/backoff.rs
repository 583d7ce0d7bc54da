//! Crash backoff for analyzer restarts.
//!
//! # Policy
//!
//! - Delay before restart attempt `n` (n ≥ 1 failures): `base × 2^(n−1)`,
//!   capped at `max_delay`
//! - Once `max_failures` is reached the language is refused until an
//!   explicit reset
//! - Reaching `ready` clears the record

use std::time::{Duration, Instant};

use warden_types::{LanguageId, WardenError};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_failures: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay owed after `failures` consecutive failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Failure record for one language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub failures: u32,
    pub last_attempt: Instant,
}

impl FailureRecord {
    #[must_use]
    pub fn first(at: Instant) -> Self {
        Self {
            failures: 1,
            last_attempt: at,
        }
    }

    pub fn bump(&mut self, at: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.last_attempt = at;
    }

    /// Whether a restart may be attempted at `now`.
    pub fn admit(
        &self,
        policy: &BackoffPolicy,
        language: &LanguageId,
        now: Instant,
    ) -> Result<(), WardenError> {
        if self.failures >= policy.max_failures {
            return Err(WardenError::RestartRefused {
                language: language.clone(),
                failures: self.failures,
            });
        }
        let ready_at = self.last_attempt + policy.delay_for(self.failures);
        if now < ready_at {
            return Err(WardenError::BackingOff {
                language: language.clone(),
                retry_in: ready_at - now,
            });
        }
        Ok(())
    }
}
