//! mailsync Cache - Local sync state persistence
//!
//! SQLite-based store for:
//! - Folder lists and per-folder backfill cursors
//! - Message headers and cached bodies
//! - The outbox of pending user actions
//!
//! ## Architecture
//!
//! This crate implements the `ISyncStore` port from `mailsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with versioned schema migration
//! - [`SqliteSyncStore`] - Full `ISyncStore` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use mailsync_cache::{DatabasePool, SqliteSyncStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/mailsync/mailsync.db")).await?;
//! let store = SqliteSyncStore::new(pool.pool().clone());
//! // Use store as ISyncStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::{DatabasePool, SCHEMA_VERSION};
pub use repository::SqliteSyncStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
