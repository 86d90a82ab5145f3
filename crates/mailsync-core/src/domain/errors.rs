//! Domain error types
//!
//! This module defines error types specific to domain operations
//! (validation failures, invalid identifiers) and the classification
//! of failures reported by remote collaborators.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid folder identifier
    #[error("Invalid folder ID: {0}")]
    InvalidFolderId(String),

    /// Invalid message identifier
    #[error("Invalid message ID: {0}")]
    InvalidMessageId(String),

    /// Invalid page token
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    /// Unknown enum discriminator read from storage or input
    #[error("Unknown {kind}: {value}")]
    UnknownVariant {
        /// The kind of value being parsed
        kind: &'static str,
        /// The unrecognized value
        value: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

/// Classified failure reported by a mail provider or token provider
///
/// Provider adapters map their wire-level failures onto this taxonomy;
/// the scheduler decides retry, backoff, and surfacing from the variant alone.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeout, connection reset, DNS failure and similar
    #[error("Network error: {0}")]
    Network(String),

    /// The provider asked the client to slow down
    #[error("Throttled by provider")]
    Throttled {
        /// Provider-supplied minimum wait, if any
        retry_after: Option<Duration>,
    },

    /// Token invalid or expired, or interactive consent required
    #[error("Authentication required: {0}")]
    Auth(String),

    /// The paging cursor is no longer accepted by the provider
    #[error("Sync cursor expired")]
    StaleCursor,

    /// The request can never succeed as issued (malformed payload, missing target)
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Returns true if retrying later may succeed without user involvement
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Throttled { .. })
    }
}
