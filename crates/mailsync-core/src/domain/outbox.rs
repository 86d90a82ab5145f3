//! Outbox entries: user mutations awaiting upload
//!
//! The write path records a [`PendingAction`] the moment the user acts,
//! applies the corresponding [`LocalMutation`] to the local store in the same
//! commit, and submits an upload job. The dispatcher only drains entries:
//! deleting them on acknowledgment, or recording the failure.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    errors::DomainError,
    newtypes::{AccountId, FolderId, MessageId, PendingActionId},
};

/// What the user did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingActionKind {
    MarkRead,
    MarkUnread,
    Delete,
    Move { destination: FolderId },
    Send,
}

impl PendingActionKind {
    /// Returns the storage name of the action kind
    pub fn name(&self) -> &'static str {
        match self {
            PendingActionKind::MarkRead => "mark_read",
            PendingActionKind::MarkUnread => "mark_unread",
            PendingActionKind::Delete => "delete",
            PendingActionKind::Move { .. } => "move",
            PendingActionKind::Send => "send",
        }
    }

    /// The optimistic local change that mirrors this action, if any
    ///
    /// `Send` has no local counterpart: the message is not in a synced folder
    /// until the provider files it.
    pub fn local_mutation(&self) -> Option<LocalMutation> {
        match self {
            PendingActionKind::MarkRead => Some(LocalMutation::SetRead(true)),
            PendingActionKind::MarkUnread => Some(LocalMutation::SetRead(false)),
            PendingActionKind::Delete => Some(LocalMutation::MarkDeleted),
            PendingActionKind::Move { destination } => {
                Some(LocalMutation::MoveTo(destination.clone()))
            }
            PendingActionKind::Send => None,
        }
    }
}

impl FromStr for PendingActionKind {
    type Err = DomainError;

    /// Parses the simple kinds; `move` needs its destination and is stored as JSON
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mark_read" => Ok(PendingActionKind::MarkRead),
            "mark_unread" => Ok(PendingActionKind::MarkUnread),
            "delete" => Ok(PendingActionKind::Delete),
            "send" => Ok(PendingActionKind::Send),
            other => Err(DomainError::UnknownVariant {
                kind: "pending action kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Optimistic change applied to the local copy of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LocalMutation {
    SetRead(bool),
    MarkDeleted,
    MoveTo(FolderId),
}

/// An outbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: PendingActionId,
    pub account_id: AccountId,
    pub kind: PendingActionKind,
    /// Message the action targets (for `Send`, the local draft id)
    pub target_id: MessageId,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the attempt ceiling is reached; failed entries are not drained
    pub failed: bool,
}

impl PendingAction {
    /// Creates a fresh outbox entry
    pub fn new(
        account_id: AccountId,
        kind: PendingActionKind,
        target_id: MessageId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PendingActionId::new(),
            account_id,
            kind,
            target_id,
            attempt_count: 0,
            last_error: None,
            created_at,
            failed: false,
        }
    }

    /// Records one failed upload attempt
    ///
    /// Returns true if the entry just reached `max_attempts` and is now
    /// marked failed.
    pub fn record_failure(&mut self, error: impl Into<String>, max_attempts: u32) -> bool {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.into());
        if !self.failed && self.attempt_count >= max_attempts {
            self.failed = true;
            return true;
        }
        false
    }

    /// Records a connectivity or throttling failure
    ///
    /// Only the error is kept; the attempt count and the failed flag are
    /// left alone, so an offline device never exhausts the entry.
    pub fn record_transient_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}
