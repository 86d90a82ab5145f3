//! SQLite implementation of ISyncStore
//!
//! This module provides the concrete SQLite-based implementation of the
//! sync store port defined in mailsync-core. It handles domain type
//! serialization and applies [`SyncCommit`] changesets transactionally.
//!
//! ## Type Mapping
//!
//! | Domain Type                    | SQL Type | Strategy                                   |
//! |--------------------------------|----------|--------------------------------------------|
//! | AccountId, PendingActionId     | TEXT     | UUID string via `.to_string()` / `FromStr` |
//! | FolderId, MessageId, PageToken | TEXT     | String via `.as_str()` / `::new()`         |
//! | FolderRole                     | TEXT     | `.as_str()` / `FromStr`                    |
//! | PendingActionKind              | TEXT     | serde_json serialization                   |
//! | DateTime<Utc>                  | TEXT     | fixed-width RFC 3339 (microseconds, `Z`)   |
//! | bool                           | INTEGER  | 0 / 1                                      |
//!
//! ## Conflict Handling
//!
//! Message rows carry the `applied_at` stamp of the commit that last wrote
//! them. Header inserts and local mutations go through
//! [`last_write_wins`]; a write older than the stored stamp is skipped.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use mailsync_core::domain::{
    last_write_wins,
    newtypes::{AccountId, FolderId, MessageId, PageToken, PendingActionId},
    Folder, FolderRole, FolderSyncState, LocalMutation, MessageBody, MessageHeader,
    PendingAction, PendingActionKind, Winner,
};
use mailsync_core::ports::{ISyncStore, StoreMutation, SyncCommit};

use crate::CacheError;

/// SQLite-based implementation of the sync store port
///
/// All reads go through the connection pool; every [`SyncCommit`] runs in
/// its own transaction.
pub struct SqliteSyncStore {
    pool: SqlitePool,
}

impl SqliteSyncStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reads a stored message header, for inspection and tests
    pub async fn message(
        &self,
        account_id: &AccountId,
        message_id: &MessageId,
    ) -> anyhow::Result<Option<MessageHeader>> {
        let row = sqlx::query("SELECT * FROM messages WHERE account_id = ? AND id = ?")
            .bind(account_id.to_string())
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(message_from_row(r)?)),
            None => Ok(None),
        }
    }

    /// Lists stored message headers of a folder, newest first
    pub async fn messages_in_folder(
        &self,
        account_id: &AccountId,
        folder_id: &FolderId,
    ) -> anyhow::Result<Vec<MessageHeader>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE account_id = ? AND folder_id = ? \
             ORDER BY received_at DESC, id ASC",
        )
        .bind(account_id.to_string())
        .bind(folder_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| message_from_row(r).map_err(Into::into))
            .collect()
    }

    /// Reads a cached message body
    pub async fn message_body(
        &self,
        account_id: &AccountId,
        message_id: &MessageId,
    ) -> anyhow::Result<Option<MessageBody>> {
        let row = sqlx::query(
            "SELECT message_id, content FROM message_bodies \
             WHERE account_id = ? AND message_id = ?",
        )
        .bind(account_id.to_string())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let id: String = r.get("message_id");
                Ok(Some(MessageBody {
                    message_id: parse_message_id(&id)?,
                    content: r.get("content"),
                }))
            }
            None => Ok(None),
        }
    }

    /// Lists the accounts that have any persisted sync state
    pub async fn known_accounts(&self) -> anyhow::Result<Vec<AccountId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT account_id FROM folders \
             UNION SELECT account_id FROM folder_sync_state \
             UNION SELECT account_id FROM pending_actions \
             ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|s| parse_account_id(s).map_err(Into::into))
            .collect()
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Formats a timestamp so that lexical order equals chronological order
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a DateTime<Utc> from an RFC 3339 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional DateTime<Utc> from an optional string
fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn parse_account_id(s: &str) -> Result<AccountId, CacheError> {
    AccountId::from_str(s).map_err(|e| CacheError::SerializationError(e.to_string()))
}

fn parse_folder_id(s: &str) -> Result<FolderId, CacheError> {
    FolderId::new(s).map_err(|e| CacheError::SerializationError(e.to_string()))
}

fn parse_message_id(s: &str) -> Result<MessageId, CacheError> {
    MessageId::new(s).map_err(|e| CacheError::SerializationError(e.to_string()))
}

fn parse_page_token(s: Option<String>) -> Result<Option<PageToken>, CacheError> {
    s.map(|t| PageToken::new(t).map_err(|e| CacheError::SerializationError(e.to_string())))
        .transpose()
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn folder_from_row(row: &SqliteRow) -> Result<Folder, CacheError> {
    let id: String = row.get("id");
    let account_id: String = row.get("account_id");
    let role: String = row.get("role");

    Ok(Folder {
        id: parse_folder_id(&id)?,
        account_id: parse_account_id(&account_id)?,
        name: row.get("name"),
        role: FolderRole::from_str(&role)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?,
    })
}

fn folder_state_from_row(row: &SqliteRow) -> Result<FolderSyncState, CacheError> {
    let folder_id: String = row.get("folder_id");
    let account_id: String = row.get("account_id");

    Ok(FolderSyncState {
        folder_id: parse_folder_id(&folder_id)?,
        account_id: parse_account_id(&account_id)?,
        next_page_token: parse_page_token(row.get("next_page_token"))?,
        last_full_sync_at: parse_optional_datetime(row.get("last_full_sync_at"))?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageHeader, CacheError> {
    let id: String = row.get("id");
    let account_id: String = row.get("account_id");
    let folder_id: String = row.get("folder_id");
    let received_at: String = row.get("received_at");

    Ok(MessageHeader {
        id: parse_message_id(&id)?,
        account_id: parse_account_id(&account_id)?,
        folder_id: parse_folder_id(&folder_id)?,
        subject: row.get("subject"),
        sender: row.get("sender"),
        received_at: parse_datetime(&received_at)?,
        is_read: row.get("is_read"),
        is_deleted: row.get("is_deleted"),
    })
}

fn pending_action_from_row(row: &SqliteRow) -> Result<PendingAction, CacheError> {
    let id: String = row.get("id");
    let account_id: String = row.get("account_id");
    let kind: String = row.get("kind");
    let target_id: String = row.get("target_id");
    let attempt_count: i64 = row.get("attempt_count");
    let created_at: String = row.get("created_at");

    let kind: PendingActionKind = serde_json::from_str(&kind).map_err(|e| {
        CacheError::SerializationError(format!("Failed to parse action kind: {}", e))
    })?;

    Ok(PendingAction {
        id: PendingActionId::from_str(&id)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?,
        account_id: parse_account_id(&account_id)?,
        kind,
        target_id: parse_message_id(&target_id)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        last_error: row.get("last_error"),
        created_at: parse_datetime(&created_at)?,
        failed: row.get("failed"),
    })
}

// ============================================================================
// Mutation helpers (run inside the commit transaction)
// ============================================================================

async fn upsert_folder_state(
    conn: &mut SqliteConnection,
    state: &FolderSyncState,
    applied_at: &str,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT INTO folder_sync_state \
         (account_id, folder_id, next_page_token, last_full_sync_at, applied_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (account_id, folder_id) DO UPDATE SET \
         next_page_token = excluded.next_page_token, \
         last_full_sync_at = excluded.last_full_sync_at, \
         applied_at = excluded.applied_at",
    )
    .bind(state.account_id.to_string())
    .bind(state.folder_id.as_str())
    .bind(state.next_page_token.as_ref().map(|t| t.as_str().to_string()))
    .bind(state.last_full_sync_at.as_ref().map(format_datetime))
    .bind(applied_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Returns the stamp of the stored message row, if any
async fn message_stamp(
    conn: &mut SqliteConnection,
    account_id: &str,
    message_id: &str,
) -> Result<Option<DateTime<Utc>>, CacheError> {
    let stamp: Option<String> =
        sqlx::query_scalar("SELECT applied_at FROM messages WHERE account_id = ? AND id = ?")
            .bind(account_id)
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?;
    stamp.as_deref().map(parse_datetime).transpose()
}

async fn insert_messages(
    conn: &mut SqliteConnection,
    batch: &[MessageHeader],
    applied_at: &DateTime<Utc>,
) -> Result<usize, CacheError> {
    let stamp = format_datetime(applied_at);
    let mut written = 0;

    for header in batch {
        let account_id = header.account_id.to_string();
        if let Some(stored) = message_stamp(conn, &account_id, header.id.as_str()).await? {
            if last_write_wins(stored, *applied_at) == Winner::Stored {
                tracing::trace!(message_id = %header.id, "Skipped stale header write");
                continue;
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO messages \
             (account_id, id, folder_id, subject, sender, received_at, \
              is_read, is_deleted, applied_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account_id)
        .bind(header.id.as_str())
        .bind(header.folder_id.as_str())
        .bind(&header.subject)
        .bind(&header.sender)
        .bind(format_datetime(&header.received_at))
        .bind(header.is_read)
        .bind(header.is_deleted)
        .bind(&stamp)
        .execute(&mut *conn)
        .await?;
        written += 1;
    }

    Ok(written)
}

async fn apply_local_mutation(
    conn: &mut SqliteConnection,
    account_id: &AccountId,
    message_id: &MessageId,
    mutation: &LocalMutation,
    applied_at: &DateTime<Utc>,
) -> Result<(), CacheError> {
    let account = account_id.to_string();
    match message_stamp(conn, &account, message_id.as_str()).await? {
        None => {
            tracing::debug!(message_id = %message_id, "Local mutation on unknown message");
            return Ok(());
        }
        Some(stored) if last_write_wins(stored, *applied_at) == Winner::Stored => {
            tracing::trace!(message_id = %message_id, "Skipped stale local mutation");
            return Ok(());
        }
        Some(_) => {}
    }

    let stamp = format_datetime(applied_at);
    let query = match mutation {
        LocalMutation::SetRead(read) => {
            sqlx::query("UPDATE messages SET is_read = ?, applied_at = ? WHERE account_id = ? AND id = ?")
                .bind(*read)
        }
        LocalMutation::MarkDeleted => sqlx::query(
            "UPDATE messages SET is_deleted = 1, applied_at = ? WHERE account_id = ? AND id = ?",
        ),
        LocalMutation::MoveTo(destination) => {
            sqlx::query("UPDATE messages SET folder_id = ?, applied_at = ? WHERE account_id = ? AND id = ?")
                .bind(destination.as_str())
        }
    };

    query
        .bind(&stamp)
        .bind(&account)
        .bind(message_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn save_message_body(
    conn: &mut SqliteConnection,
    account_id: &AccountId,
    body: &MessageBody,
    applied_at: &str,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT OR REPLACE INTO message_bodies \
         (account_id, message_id, content, size_bytes, fetched_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(account_id.to_string())
    .bind(body.message_id.as_str())
    .bind(&body.content)
    .bind(i64::try_from(body.size_bytes()).unwrap_or(i64::MAX))
    .bind(applied_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn replace_folders(
    conn: &mut SqliteConnection,
    account_id: &AccountId,
    folders: &[Folder],
) -> Result<(), CacheError> {
    let account = account_id.to_string();

    sqlx::query("DELETE FROM folders WHERE account_id = ?")
        .bind(&account)
        .execute(&mut *conn)
        .await?;

    for folder in folders {
        sqlx::query("INSERT OR REPLACE INTO folders (account_id, id, name, role) VALUES (?, ?, ?, ?)")
            .bind(&account)
            .bind(folder.id.as_str())
            .bind(&folder.name)
            .bind(folder.role.as_str())
            .execute(&mut *conn)
            .await?;
    }

    // Cursors of folders that no longer exist would be resumed forever
    sqlx::query(
        "DELETE FROM folder_sync_state WHERE account_id = ? \
         AND folder_id NOT IN (SELECT id FROM folders WHERE account_id = ?)",
    )
    .bind(&account)
    .bind(&account)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_pending_action(
    conn: &mut SqliteConnection,
    action: &PendingAction,
) -> Result<(), CacheError> {
    let kind = serde_json::to_string(&action.kind).map_err(|e| {
        CacheError::SerializationError(format!("Failed to serialize action kind: {}", e))
    })?;

    sqlx::query(
        "INSERT INTO pending_actions \
         (id, account_id, kind, target_id, attempt_count, last_error, created_at, failed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(action.id.to_string())
    .bind(action.account_id.to_string())
    .bind(&kind)
    .bind(action.target_id.as_str())
    .bind(i64::from(action.attempt_count))
    .bind(&action.last_error)
    .bind(format_datetime(&action.created_at))
    .bind(action.failed)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_pending_action(
    conn: &mut SqliteConnection,
    action: &PendingAction,
) -> Result<(), CacheError> {
    let result = sqlx::query(
        "UPDATE pending_actions SET attempt_count = ?, last_error = ?, failed = ? WHERE id = ?",
    )
    .bind(i64::from(action.attempt_count))
    .bind(&action.last_error)
    .bind(action.failed)
    .bind(action.id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CacheError::QueryFailed(format!(
            "Pending action {} not found",
            action.id
        )));
    }
    Ok(())
}

async fn delete_pending_action(
    conn: &mut SqliteConnection,
    id: &PendingActionId,
) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM pending_actions WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ============================================================================
// ISyncStore implementation
// ============================================================================

#[async_trait::async_trait]
impl ISyncStore for SqliteSyncStore {
    async fn commit(&self, commit: SyncCommit) -> anyhow::Result<()> {
        if commit.is_empty() {
            return Ok(());
        }

        let applied_at = commit.applied_at();
        let stamp = format_datetime(&applied_at);
        let mutations = commit.into_mutations();
        let count = mutations.len();

        let mut tx = self.pool.begin().await?;

        for mutation in &mutations {
            match mutation {
                StoreMutation::UpsertFolderState(state) => {
                    upsert_folder_state(&mut tx, state, &stamp).await?;
                }
                StoreMutation::InsertMessages(batch) => {
                    let written = insert_messages(&mut tx, batch, &applied_at).await?;
                    tracing::trace!(written, total = batch.len(), "Inserted message headers");
                }
                StoreMutation::SaveMessageBody { account_id, body } => {
                    save_message_body(&mut tx, account_id, body, &stamp).await?;
                }
                StoreMutation::ReplaceFolders {
                    account_id,
                    folders,
                } => {
                    replace_folders(&mut tx, account_id, folders).await?;
                }
                StoreMutation::InsertPendingAction(action) => {
                    insert_pending_action(&mut tx, action).await?;
                }
                StoreMutation::UpdatePendingAction(action) => {
                    update_pending_action(&mut tx, action).await?;
                }
                StoreMutation::DeletePendingAction(id) => {
                    delete_pending_action(&mut tx, id).await?;
                }
                StoreMutation::ApplyLocalMutation {
                    account_id,
                    message_id,
                    mutation,
                } => {
                    apply_local_mutation(&mut tx, account_id, message_id, mutation, &applied_at)
                        .await?;
                }
            }
        }

        tx.commit().await?;

        tracing::trace!(mutations = count, applied_at = %stamp, "Committed sync changeset");
        Ok(())
    }

    async fn folder_state(
        &self,
        account_id: &AccountId,
        folder_id: &FolderId,
    ) -> anyhow::Result<Option<FolderSyncState>> {
        let row = sqlx::query(
            "SELECT * FROM folder_sync_state WHERE account_id = ? AND folder_id = ?",
        )
        .bind(account_id.to_string())
        .bind(folder_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(folder_state_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn folder_states(&self, account_id: &AccountId) -> anyhow::Result<Vec<FolderSyncState>> {
        let rows =
            sqlx::query("SELECT * FROM folder_sync_state WHERE account_id = ? ORDER BY folder_id")
                .bind(account_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|r| folder_state_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn folders(&self, account_id: &AccountId) -> anyhow::Result<Vec<Folder>> {
        let rows = sqlx::query("SELECT * FROM folders WHERE account_id = ? ORDER BY name, id")
            .bind(account_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| folder_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn pending_action(&self, id: &PendingActionId) -> anyhow::Result<Option<PendingAction>> {
        let row = sqlx::query("SELECT * FROM pending_actions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(pending_action_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn pending_actions(&self, account_id: &AccountId) -> anyhow::Result<Vec<PendingAction>> {
        let rows = sqlx::query(
            "SELECT * FROM pending_actions WHERE account_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| pending_action_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn cache_size(&self, account_id: &AccountId) -> anyhow::Result<u64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM message_bodies WHERE account_id = ?",
        )
        .bind(account_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn evict_cache(&self, account_id: &AccountId, target_bytes: u64) -> anyhow::Result<u64> {
        let account = account_id.to_string();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT message_id, size_bytes FROM message_bodies WHERE account_id = ? \
             ORDER BY fetched_at ASC, message_id ASC",
        )
        .bind(&account)
        .fetch_all(&mut *tx)
        .await?;

        let mut remaining: u64 = rows
            .iter()
            .map(|r| u64::try_from(r.get::<i64, _>("size_bytes")).unwrap_or(0))
            .sum();
        let mut freed = 0u64;
        let mut evicted = 0usize;

        for row in &rows {
            if remaining <= target_bytes {
                break;
            }
            let message_id: String = row.get("message_id");
            let size = u64::try_from(row.get::<i64, _>("size_bytes")).unwrap_or(0);

            sqlx::query("DELETE FROM message_bodies WHERE account_id = ? AND message_id = ?")
                .bind(&account)
                .bind(&message_id)
                .execute(&mut *tx)
                .await?;

            remaining = remaining.saturating_sub(size);
            freed += size;
            evicted += 1;
        }

        tx.commit().await?;

        tracing::debug!(
            account_id = %account_id,
            evicted,
            freed_bytes = freed,
            remaining_bytes = remaining,
            "Evicted cached message bodies"
        );
        Ok(freed)
    }
}
