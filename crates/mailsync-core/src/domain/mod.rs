//! Domain entities and business logic
//!
//! This module contains the core domain types for mailsync:
//! - Newtypes for type-safe identifiers and validated domain types
//! - The sync job model and its priorities
//! - Folder, message and outbox records
//! - Status snapshots published to observers
//! - The last-write-wins conflict policy
//! - Domain-specific error types

pub mod conflict;
pub mod errors;
pub mod folder;
pub mod job;
pub mod message;
pub mod newtypes;
pub mod outbox;
pub mod status;

// Re-export commonly used types
pub use conflict::{last_write_wins, Winner};
pub use errors::{DomainError, ProviderError};
pub use folder::{Folder, FolderRole, FolderSyncState};
pub use job::{DedupKey, JobKind, JobTier, Priority, SyncJob};
pub use message::{MessageBody, MessageHeader};
pub use newtypes::*;
pub use outbox::{LocalMutation, PendingAction, PendingActionKind};
pub use status::{AccountStatus, SyncState};
