//! mailsync Sync - Priority synchronization scheduler
//!
//! Provides:
//! - A deduplicating priority job queue with per-account in-flight gating
//! - The dispatcher that executes jobs against the provider and the store
//! - Per-account exponential backoff and reauthentication suspension
//! - The polling lifecycle manager (active, passive, initial sync)
//! - A broadcast stream of per-account status snapshots
//!
//! ## Modules
//!
//! - [`queue`] - Job queue with dedup, eligibility and completion
//! - [`backoff`] - Backoff policy and the per-account sync context
//! - [`controller`] - The dispatcher (`SyncController`)
//! - [`polling`] - Lifecycle state machine and its driver
//! - [`status`] - Status snapshot broadcasting

pub mod backoff;
pub mod controller;
pub mod polling;
pub mod queue;
pub mod status;

use mailsync_core::domain::newtypes::AccountId;
use thiserror::Error;

pub use controller::{JobOutcome, JobReport, RestoreSummary, SyncController};
pub use polling::{LifecycleSignal, PollingManager, PollingState};
pub use queue::{JobQueue, SubmitOutcome};

/// Errors returned by the scheduler's public operations
///
/// Failures of individual jobs never surface here: they are classified,
/// retried or dropped inside the dispatcher and reported through status.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The account was never registered with the controller
    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    /// The queue was closed; the scheduler is shutting down
    #[error("Job queue closed")]
    QueueClosed,

    /// A store read or write failed
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
