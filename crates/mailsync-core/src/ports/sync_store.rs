//! Sync store port (driven/secondary port)
//!
//! This module defines the interface to the on-device persistent store as
//! seen by the scheduler: folder cursors, the outbox, message records and
//! cache accounting.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, filesystem, etc.) and the scheduler treats every store failure
//!   the same way: fatal for the current job execution, retried later.
//! - Writes are expressed as a [`SyncCommit`]: an ordered changeset that the
//!   adapter applies inside one transaction. A commit is either fully applied
//!   or not at all, so a cursor can never advance without its page's items
//!   (or the reverse), even across a crash.
//! - Every commit carries the wall-clock time it was built at; adapters use
//!   it as the application stamp for last-write-wins on message rows.

use chrono::{DateTime, Utc};

use crate::domain::{
    newtypes::{AccountId, FolderId, MessageId, PendingActionId},
    Folder, FolderSyncState, LocalMutation, MessageBody, MessageHeader, PendingAction,
};

// ============================================================================
// StoreMutation / SyncCommit
// ============================================================================

/// One change inside a [`SyncCommit`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreMutation {
    /// Insert or replace the cursor row of a folder
    UpsertFolderState(FolderSyncState),
    /// Insert or update message headers (last-write-wins per message)
    InsertMessages(Vec<MessageHeader>),
    /// Store the full body of a message
    SaveMessageBody {
        account_id: AccountId,
        body: MessageBody,
    },
    /// Replace the folder list of an account
    ReplaceFolders {
        account_id: AccountId,
        folders: Vec<Folder>,
    },
    /// Record a new outbox entry
    InsertPendingAction(PendingAction),
    /// Overwrite an outbox entry (attempt count, last error, failed flag)
    UpdatePendingAction(PendingAction),
    /// Remove an acknowledged outbox entry
    DeletePendingAction(PendingActionId),
    /// Apply an optimistic local change to a stored message
    ApplyLocalMutation {
        account_id: AccountId,
        message_id: MessageId,
        mutation: LocalMutation,
    },
}

/// An atomic changeset for the sync store
///
/// Built with the chaining methods below and handed to
/// [`ISyncStore::commit`], which applies all mutations in order within a
/// single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCommit {
    applied_at: DateTime<Utc>,
    mutations: Vec<StoreMutation>,
}

impl SyncCommit {
    /// Starts an empty changeset stamped with `applied_at`
    pub fn new(applied_at: DateTime<Utc>) -> Self {
        Self {
            applied_at,
            mutations: Vec::new(),
        }
    }

    /// Application stamp used for last-write-wins
    pub fn applied_at(&self) -> DateTime<Utc> {
        self.applied_at
    }

    /// The mutations in application order
    pub fn mutations(&self) -> &[StoreMutation] {
        &self.mutations
    }

    /// Consumes the commit, returning its mutations
    pub fn into_mutations(self) -> Vec<StoreMutation> {
        self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn push(mut self, mutation: StoreMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn upsert_folder_state(self, state: FolderSyncState) -> Self {
        self.push(StoreMutation::UpsertFolderState(state))
    }

    /// Adds message headers; an empty batch adds nothing
    pub fn insert_messages(self, batch: Vec<MessageHeader>) -> Self {
        if batch.is_empty() {
            return self;
        }
        self.push(StoreMutation::InsertMessages(batch))
    }

    pub fn save_message_body(self, account_id: AccountId, body: MessageBody) -> Self {
        self.push(StoreMutation::SaveMessageBody { account_id, body })
    }

    pub fn replace_folders(self, account_id: AccountId, folders: Vec<Folder>) -> Self {
        self.push(StoreMutation::ReplaceFolders {
            account_id,
            folders,
        })
    }

    pub fn insert_pending_action(self, action: PendingAction) -> Self {
        self.push(StoreMutation::InsertPendingAction(action))
    }

    pub fn update_pending_action(self, action: PendingAction) -> Self {
        self.push(StoreMutation::UpdatePendingAction(action))
    }

    pub fn delete_pending_action(self, id: PendingActionId) -> Self {
        self.push(StoreMutation::DeletePendingAction(id))
    }

    pub fn apply_local_mutation(
        self,
        account_id: AccountId,
        message_id: MessageId,
        mutation: LocalMutation,
    ) -> Self {
        self.push(StoreMutation::ApplyLocalMutation {
            account_id,
            message_id,
            mutation,
        })
    }
}

// ============================================================================
// ISyncStore trait
// ============================================================================

/// Port trait for the persistent sync state
///
/// ## Implementation Notes
///
/// - `commit` must be all-or-nothing.
/// - `pending_actions` returns entries in creation order (oldest first),
///   including entries already marked failed.
/// - `cache_size` counts stored message bodies of the account, in bytes.
/// - `evict_cache` removes bodies, least recently fetched first, until the
///   account's cache size is at or below `target_bytes`, and returns the
///   number of bytes freed.
#[async_trait::async_trait]
pub trait ISyncStore: Send + Sync {
    /// Applies a changeset atomically
    async fn commit(&self, commit: SyncCommit) -> anyhow::Result<()>;

    /// Reads the cursor row of a folder
    async fn folder_state(
        &self,
        account_id: &AccountId,
        folder_id: &FolderId,
    ) -> anyhow::Result<Option<FolderSyncState>>;

    /// Reads all cursor rows of an account
    async fn folder_states(&self, account_id: &AccountId) -> anyhow::Result<Vec<FolderSyncState>>;

    /// Reads the folder list of an account
    async fn folders(&self, account_id: &AccountId) -> anyhow::Result<Vec<Folder>>;

    /// Reads one outbox entry
    async fn pending_action(&self, id: &PendingActionId) -> anyhow::Result<Option<PendingAction>>;

    /// Reads the outbox of an account, oldest first
    async fn pending_actions(&self, account_id: &AccountId) -> anyhow::Result<Vec<PendingAction>>;

    /// Bytes of cached message bodies for an account
    async fn cache_size(&self, account_id: &AccountId) -> anyhow::Result<u64>;

    /// Evicts cached bodies until the account is at or below `target_bytes`
    async fn evict_cache(&self, account_id: &AccountId, target_bytes: u64) -> anyhow::Result<u64>;
}
