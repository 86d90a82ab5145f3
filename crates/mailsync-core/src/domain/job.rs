//! Sync job model
//!
//! A [`SyncJob`] is a discrete, priority-tagged unit of synchronization work.
//! The set of variants is closed ([`JobKind`]); every variant carries a fixed
//! priority and a payload field that identifies it for deduplication.
//!
//! ## Priorities
//!
//! | Variant                    | Priority | Tier              |
//! |----------------------------|----------|-------------------|
//! | `Reauthenticate`           | 100      | Recovery          |
//! | `FetchFullMessageBody`     | 95       | Interactive       |
//! | `FetchNextMessageListPage` | 90       | Interactive       |
//! | `ForceRefreshFolder`       | 88       | Interactive       |
//! | `SearchOnline`             | 85       | Interactive       |
//! | `UploadAction`             | 75       | Intent-fulfilling |
//! | `FetchMessageHeaders`      | 50       | Background        |
//! | `SyncFolderList`           | 40       | Background        |
//! | `EvictFromCache`           | 10       | Background        |

use std::fmt;

use serde::{Deserialize, Serialize};

use super::newtypes::{AccountId, FolderId, MessageId, PageToken, PendingActionId};

/// Scheduling priority; higher values are served first
pub type Priority = u8;

/// Coarse grouping of job priorities with tier-specific scheduling rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTier {
    /// Recovery work that unblocks a suspended account
    Recovery,
    /// Triggered synchronously by explicit user intent; bypasses backoff
    Interactive,
    /// Uploads of queued user mutations
    IntentFulfilling,
    /// Opportunistic refresh, backfill and housekeeping
    Background,
}

/// The closed set of sync job variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Ask the token provider to run interactive reauthentication
    Reauthenticate,
    /// Download the full body of a message the user opened
    FetchFullMessageBody { message_id: MessageId },
    /// Fetch the next page of a message list the user scrolled to the end of
    FetchNextMessageListPage { folder_id: FolderId },
    /// Pull-to-refresh: restart a folder from its first page
    ForceRefreshFolder { folder_id: FolderId },
    /// Server-side search issued by the user
    SearchOnline { query: String },
    /// Upload one outbox entry
    UploadAction { pending_action_id: PendingActionId },
    /// One page of background header backfill or refresh
    FetchMessageHeaders {
        folder_id: FolderId,
        page_token: Option<PageToken>,
    },
    /// Refresh the account's folder list
    SyncFolderList,
    /// Shrink the local body cache below the configured limit
    EvictFromCache,
}

impl JobKind {
    /// Returns the fixed priority for this variant
    pub fn priority(&self) -> Priority {
        match self {
            JobKind::Reauthenticate => 100,
            JobKind::FetchFullMessageBody { .. } => 95,
            JobKind::FetchNextMessageListPage { .. } => 90,
            JobKind::ForceRefreshFolder { .. } => 88,
            JobKind::SearchOnline { .. } => 85,
            JobKind::UploadAction { .. } => 75,
            JobKind::FetchMessageHeaders { .. } => 50,
            JobKind::SyncFolderList => 40,
            JobKind::EvictFromCache => 10,
        }
    }

    /// Returns the scheduling tier for this variant
    pub fn tier(&self) -> JobTier {
        match self {
            JobKind::Reauthenticate => JobTier::Recovery,
            JobKind::FetchFullMessageBody { .. }
            | JobKind::FetchNextMessageListPage { .. }
            | JobKind::ForceRefreshFolder { .. }
            | JobKind::SearchOnline { .. } => JobTier::Interactive,
            JobKind::UploadAction { .. } => JobTier::IntentFulfilling,
            JobKind::FetchMessageHeaders { .. }
            | JobKind::SyncFolderList
            | JobKind::EvictFromCache => JobTier::Background,
        }
    }

    /// Stable variant name used in dedup keys and logs
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Reauthenticate => "reauthenticate",
            JobKind::FetchFullMessageBody { .. } => "fetch_full_message_body",
            JobKind::FetchNextMessageListPage { .. } => "fetch_next_message_list_page",
            JobKind::ForceRefreshFolder { .. } => "force_refresh_folder",
            JobKind::SearchOnline { .. } => "search_online",
            JobKind::UploadAction { .. } => "upload_action",
            JobKind::FetchMessageHeaders { .. } => "fetch_message_headers",
            JobKind::SyncFolderList => "sync_folder_list",
            JobKind::EvictFromCache => "evict_from_cache",
        }
    }

    /// Payload field that identifies the job within its variant
    ///
    /// The page token of `FetchMessageHeaders` is deliberately excluded so that
    /// a folder never has two header fetches queued at once.
    fn identity(&self) -> Option<String> {
        match self {
            JobKind::FetchFullMessageBody { message_id } => Some(message_id.to_string()),
            JobKind::FetchNextMessageListPage { folder_id }
            | JobKind::ForceRefreshFolder { folder_id }
            | JobKind::FetchMessageHeaders { folder_id, .. } => Some(folder_id.to_string()),
            JobKind::SearchOnline { query } => Some(query.clone()),
            JobKind::UploadAction { pending_action_id } => Some(pending_action_id.to_string()),
            JobKind::Reauthenticate | JobKind::SyncFolderList | JobKind::EvictFromCache => None,
        }
    }

    /// Folder the job operates on, if any
    pub fn folder_id(&self) -> Option<&FolderId> {
        match self {
            JobKind::FetchNextMessageListPage { folder_id }
            | JobKind::ForceRefreshFolder { folder_id }
            | JobKind::FetchMessageHeaders { folder_id, .. } => Some(folder_id),
            _ => None,
        }
    }
}

/// Identity used to collapse duplicate submissions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    account_id: AccountId,
    variant: &'static str,
    identity: Option<String>,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(identity) => write!(f, "{}/{}/{}", self.account_id, self.variant, identity),
            None => write!(f, "{}/{}", self.account_id, self.variant),
        }
    }
}

/// A unit of synchronization work for one account
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    account_id: AccountId,
    kind: JobKind,
}

impl SyncJob {
    /// Creates a job for the given account
    pub fn new(account_id: AccountId, kind: JobKind) -> Self {
        Self { account_id, kind }
    }

    /// Returns the account this job belongs to
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Returns the variant and payload
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    /// Returns the fixed priority of the variant
    pub fn priority(&self) -> Priority {
        self.kind.priority()
    }

    /// Returns the scheduling tier of the variant
    pub fn tier(&self) -> JobTier {
        self.kind.tier()
    }

    /// Returns true if the job may run while its account is backing off
    pub fn bypasses_backoff(&self) -> bool {
        self.tier() == JobTier::Interactive
    }

    /// Returns the dedup key (account + variant + identifying payload)
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            account_id: self.account_id,
            variant: self.kind.name(),
            identity: self.kind.identity(),
        }
    }

    // --- Convenience constructors ---

    pub fn fetch_body(account_id: AccountId, message_id: MessageId) -> Self {
        Self::new(account_id, JobKind::FetchFullMessageBody { message_id })
    }

    pub fn next_page(account_id: AccountId, folder_id: FolderId) -> Self {
        Self::new(account_id, JobKind::FetchNextMessageListPage { folder_id })
    }

    pub fn force_refresh(account_id: AccountId, folder_id: FolderId) -> Self {
        Self::new(account_id, JobKind::ForceRefreshFolder { folder_id })
    }

    pub fn search(account_id: AccountId, query: impl Into<String>) -> Self {
        Self::new(
            account_id,
            JobKind::SearchOnline {
                query: query.into(),
            },
        )
    }

    pub fn upload(account_id: AccountId, pending_action_id: PendingActionId) -> Self {
        Self::new(account_id, JobKind::UploadAction { pending_action_id })
    }

    pub fn fetch_headers(
        account_id: AccountId,
        folder_id: FolderId,
        page_token: Option<PageToken>,
    ) -> Self {
        Self::new(
            account_id,
            JobKind::FetchMessageHeaders {
                folder_id,
                page_token,
            },
        )
    }

    pub fn sync_folder_list(account_id: AccountId) -> Self {
        Self::new(account_id, JobKind::SyncFolderList)
    }

    pub fn evict(account_id: AccountId) -> Self {
        Self::new(account_id, JobKind::EvictFromCache)
    }

    pub fn reauthenticate(account_id: AccountId) -> Self {
        Self::new(account_id, JobKind::Reauthenticate)
    }
}

impl fmt::Display for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(p{})", self.dedup_key(), self.priority())
    }
}
