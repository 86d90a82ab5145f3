//! Host platform ports (driven/secondary ports)
//!
//! The scheduler runs inside a host process whose lifecycle it does not
//! control. These ports abstract the host primitives the polling lifecycle
//! manager needs, plus the single user preference it reads.

use std::time::Duration;

use crate::domain::newtypes::AccountId;

/// Port trait for host scheduling primitives
///
/// ## Implementation Notes
///
/// - A periodic wake fires roughly every `interval` while the app is in the
///   background and is delivered back as a lifecycle signal.
/// - Foreground execution keeps the process alive (foreground service,
///   background task assertion, inhibitor lock) until released.
/// - Implementations should treat repeated register/request calls as
///   idempotent.
#[async_trait::async_trait]
pub trait IHostScheduler: Send + Sync {
    /// Registers the background periodic wake
    async fn register_periodic_wake(&self, interval: Duration) -> anyhow::Result<()>;

    /// Cancels the background periodic wake
    async fn cancel_periodic_wake(&self) -> anyhow::Result<()>;

    /// Asks the host to keep the process running
    async fn request_foreground_execution(&self, reason: &str) -> anyhow::Result<()>;

    /// Releases a previous foreground execution request
    async fn release_foreground_execution(&self) -> anyhow::Result<()>;
}

/// Port trait for user preferences read by the scheduler
#[async_trait::async_trait]
pub trait IUserPreferences: Send + Sync {
    /// How many days of history an initial sync should download
    ///
    /// `None` means the user has not chosen; the configured default applies.
    async fn initial_sync_duration_days(&self, account_id: &AccountId) -> anyhow::Result<Option<u32>>;
}
