//! Per-account sync status snapshots published to observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::AccountId;

/// Coarse sync state of an account as shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of one account's sync status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account_id: AccountId,
    pub state: SyncState,
    pub last_error: Option<String>,
    /// The account is suspended until the user reauthenticates
    pub needs_reauthentication: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccountStatus {
    /// Idle status with no error
    pub fn idle(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            state: SyncState::Idle,
            last_error: None,
            needs_reauthentication: false,
            updated_at: now,
        }
    }
}
