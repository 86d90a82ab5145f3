//! Status snapshot broadcasting
//!
//! Every state change of an account (job started, job finished, failure
//! surfaced) is published as an [`AccountStatus`] snapshot. Observers
//! subscribe to a `tokio::sync::broadcast` channel; the latest snapshot per
//! account is also kept for late joiners.

use dashmap::DashMap;
use tokio::sync::broadcast;

use mailsync_core::domain::{newtypes::AccountId, AccountStatus};

/// Fan-out of account status snapshots
pub struct StatusBroadcaster {
    tx: broadcast::Sender<AccountStatus>,
    latest: DashMap<AccountId, AccountStatus>,
}

impl StatusBroadcaster {
    /// Creates a broadcaster buffering `capacity` snapshots per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountStatus> {
        self.tx.subscribe()
    }

    /// Records and broadcasts a snapshot
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, status: AccountStatus) {
        self.latest.insert(status.account_id, status.clone());
        let _ = self.tx.send(status);
    }

    /// Latest snapshot of an account
    pub fn latest(&self, account_id: &AccountId) -> Option<AccountStatus> {
        self.latest.get(account_id).map(|s| s.value().clone())
    }

    /// Drops the stored snapshot of an account
    pub fn forget(&self, account_id: &AccountId) {
        self.latest.remove(account_id);
    }
}
