//! # Retry Policy
//!
//! Decides whether a failed operation is retried and when.
//!
//! ```text
//! attempts │ 1     2     3     4     5
//! ─────────┼──────────────────────────────
//! delay    │ 1s    2s    4s    8s    (failed)
//! ```
//!
//! delay = min(max_backoff, 2^attempts * initial_backoff), computed with a
//! non-randomized `backoff::ExponentialBackoff` and truncated to whole
//! milliseconds.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::SyncSettings;
use crate::error::SyncError;

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return to pending, eligible again at `at`.
    RetryAt(DateTime<Utc>),
    /// Terminal: mark failed.
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next attempt, given the attempts made so far.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let mut schedule = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        };

        // The n-th interval is initial * 2^(n-1); stop early once capped.
        let mut delay = self.initial_backoff;
        for _ in 0..=attempts {
            match schedule.next_backoff() {
                Some(next) => delay = next,
                None => break,
            }
            if delay >= self.max_backoff {
                break;
            }
        }

        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(millis).min(self.max_backoff)
    }

    /// Classifies a failure. `attempts` already counts the failed attempt.
    pub fn decide(&self, error: &SyncError, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if !error.is_retryable() || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = chrono::Duration::from_std(self.delay_for(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        RetryDecision::RetryAt(now + delay)
    }
}
