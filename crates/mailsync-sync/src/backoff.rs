//! Per-account backoff policy and sync context
//!
//! After a failed job the account waits before its next non-interactive
//! job. The wait doubles with every consecutive failure up to a cap, never
//! shrinks while failures continue, and never undercuts a retry-after hint
//! from the provider. One success resets it.

use std::time::Duration;

use tokio::time::Instant;

use mailsync_core::config::BackoffConfig;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base(), config.max())
    }

    /// Interval to wait after the `failures`-th consecutive failure
    ///
    /// `min(base * 2^(failures - 1), max)`, floored by `previous` and by
    /// `retry_after`.
    pub fn interval(
        &self,
        failures: u32,
        previous: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let scaled = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        scaled.max(previous).max(retry_after.unwrap_or_default())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

/// Ephemeral scheduling state of one account
///
/// Owned by the job queue. Never persisted: a restarted process starts every
/// account from the default (idle, no backoff).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSyncContext {
    /// A job of this account is executing
    pub in_flight: bool,
    /// Non-interactive jobs are held back until this instant
    pub backoff_until: Option<Instant>,
    /// Current backoff interval; zero after a success
    pub backoff: Duration,
    pub consecutive_failures: u32,
    /// Only `Reauthenticate` jobs run until this is cleared
    pub needs_reauthentication: bool,
}

impl AccountSyncContext {
    /// Returns true if non-interactive jobs must still wait at `now`
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    /// Counts a failure and arms the backoff, returning the new interval
    pub fn record_failure(
        &mut self,
        policy: &BackoffPolicy,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.backoff = policy.interval(self.consecutive_failures, self.backoff, retry_after);
        self.backoff_until = Some(now + self.backoff);
        self.backoff
    }

    /// Clears failures, backoff and the reauthentication flag
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff = Duration::ZERO;
        self.backoff_until = None;
        self.needs_reauthentication = false;
    }
}
