//! Wall-clock port
//!
//! Persisted timestamps (`created_at`, `last_full_sync_at`, commit stamps)
//! come from an injected [`IClock`] so tests can control them. Scheduling
//! delays (backoff, poll intervals) use `tokio::time` instead, which tests
//! control by pausing the runtime clock.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Port trait for reading wall-clock time
pub trait IClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl IClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `delta`
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }

    /// Sets the clock to an absolute instant
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = instant;
    }
}

impl IClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
