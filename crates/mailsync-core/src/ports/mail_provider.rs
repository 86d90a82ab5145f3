//! Mail provider port (driven/secondary port)
//!
//! This module defines the interface the scheduler uses to talk to a remote
//! mail provider. One implementation exists per provider kind (IMAP, Gmail
//! API, Microsoft Graph, ...); the wire protocol lives entirely behind it.
//!
//! ## Design Notes
//!
//! - Errors are returned as [`ProviderError`] rather than `anyhow::Error`,
//!   because the scheduler's retry policy depends on the classification
//!   (transient, throttled, auth, stale cursor, permanent).
//! - Every call receives the access token acquired for the job; token
//!   refresh is the token provider's concern.

use chrono::{DateTime, Utc};

use crate::domain::{
    newtypes::{AccountId, FolderId, MessageId, PageToken},
    Folder, MessageBody, MessageHeader, PendingAction, ProviderError,
};
use crate::ports::token_provider::AccessToken;

/// One page of message headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPage {
    pub items: Vec<MessageHeader>,
    /// Continuation marker; `None` when the folder has no further pages
    pub next_page_token: Option<PageToken>,
}

/// Parameters for a header page fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPageRequest {
    pub account_id: AccountId,
    pub folder_id: FolderId,
    /// `None` requests the first (newest) page
    pub page_token: Option<PageToken>,
    /// Messages received before this instant are not requested
    pub date_floor: Option<DateTime<Utc>>,
}

/// Port trait for remote mail provider operations
#[async_trait::async_trait]
pub trait IMailProvider: Send + Sync {
    /// Fetches one page of message headers
    ///
    /// Returns [`ProviderError::StaleCursor`] when `page_token` is no longer
    /// accepted.
    async fn fetch_headers(
        &self,
        token: &AccessToken,
        request: &HeaderPageRequest,
    ) -> Result<HeaderPage, ProviderError>;

    /// Downloads the full body of a message
    async fn fetch_body(
        &self,
        token: &AccessToken,
        account_id: &AccountId,
        message_id: &MessageId,
    ) -> Result<MessageBody, ProviderError>;

    /// Uploads a user mutation; `Ok` means the server acknowledged it
    async fn apply_action(
        &self,
        token: &AccessToken,
        action: &PendingAction,
    ) -> Result<(), ProviderError>;

    /// Lists the folders of an account
    async fn list_folders(
        &self,
        token: &AccessToken,
        account_id: &AccountId,
    ) -> Result<Vec<Folder>, ProviderError>;

    /// Runs a server-side search
    async fn search(
        &self,
        token: &AccessToken,
        account_id: &AccountId,
        query: &str,
    ) -> Result<Vec<MessageHeader>, ProviderError>;
}
