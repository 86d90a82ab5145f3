//! Folder and folder sync state entities

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    errors::DomainError,
    newtypes::{AccountId, FolderId, PageToken},
};

/// Well-known purpose of a folder, as reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Archive,
    Trash,
    Spam,
    #[default]
    Other,
}

impl FolderRole {
    /// Returns the storage/config name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderRole::Inbox => "inbox",
            FolderRole::Sent => "sent",
            FolderRole::Drafts => "drafts",
            FolderRole::Archive => "archive",
            FolderRole::Trash => "trash",
            FolderRole::Spam => "spam",
            FolderRole::Other => "other",
        }
    }
}

impl std::fmt::Display for FolderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FolderRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbox" => Ok(FolderRole::Inbox),
            "sent" => Ok(FolderRole::Sent),
            "drafts" => Ok(FolderRole::Drafts),
            "archive" => Ok(FolderRole::Archive),
            "trash" => Ok(FolderRole::Trash),
            "spam" => Ok(FolderRole::Spam),
            "other" => Ok(FolderRole::Other),
            other => Err(DomainError::UnknownVariant {
                kind: "folder role",
                value: other.to_string(),
            }),
        }
    }
}

/// A folder of a mail account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub account_id: AccountId,
    pub name: String,
    pub role: FolderRole,
}

impl Folder {
    pub fn new(
        id: FolderId,
        account_id: AccountId,
        name: impl Into<String>,
        role: FolderRole,
    ) -> Self {
        Self {
            id,
            account_id,
            name: name.into(),
            role,
        }
    }
}

/// Durable backfill cursor for one folder
///
/// Mutated only by the dispatcher after a successful page fetch (or a
/// deliberate cursor reset), always in the same commit as the fetched items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSyncState {
    pub folder_id: FolderId,
    pub account_id: AccountId,
    /// Cursor of the next page to fetch; `None` before the first fetch and
    /// after the last page
    pub next_page_token: Option<PageToken>,
    /// When backfill last reached the final page
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

impl FolderSyncState {
    /// State of a folder that has never been fetched
    pub fn new(folder_id: FolderId, account_id: AccountId) -> Self {
        Self {
            folder_id,
            account_id,
            next_page_token: None,
            last_full_sync_at: None,
        }
    }

    /// Returns true once backfill walked every page and no cursor is pending
    pub fn is_backfill_complete(&self) -> bool {
        self.next_page_token.is_none() && self.last_full_sync_at.is_some()
    }

    /// Records a fetched page: advances the cursor, stamping completion when
    /// the provider reported no further pages
    pub fn advance(&mut self, next: Option<PageToken>, now: DateTime<Utc>) {
        if next.is_none() {
            self.last_full_sync_at = Some(now);
        }
        self.next_page_token = next;
    }

    /// Forgets the cursor so the next fetch starts from the first page
    pub fn reset_cursor(&mut self) {
        self.next_page_token = None;
    }

    /// Forgets both the cursor and the completion stamp, so the folder is
    /// backfilled again from the first page
    pub fn restart_backfill(&mut self) {
        self.next_page_token = None;
        self.last_full_sync_at = None;
    }
}
