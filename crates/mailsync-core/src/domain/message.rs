//! Message records stored by the sync engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{AccountId, FolderId, MessageId};

/// Header-level view of a message, as returned by list and search calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: MessageId,
    pub account_id: AccountId,
    pub folder_id: FolderId,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_deleted: bool,
}

/// Full content of a message, fetched on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message_id: MessageId,
    pub content: String,
}

impl MessageBody {
    /// Size in bytes counted against the cache limit
    pub fn size_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}
