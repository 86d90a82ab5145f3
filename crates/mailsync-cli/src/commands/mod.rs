//! CLI subcommands

pub mod accounts;
pub mod config;
pub mod folders;
pub mod outbox;

use std::path::Path;

use anyhow::{Context, Result};
use mailsync_cache::{DatabasePool, SqliteSyncStore};
use mailsync_core::config::Config;
use tracing::debug;

/// Opens the store named by the configuration without creating it
///
/// Returns `Ok(None)` when no database exists yet.
pub(crate) async fn open_store(config_path: &Path) -> Result<Option<SqliteSyncStore>> {
    let config = Config::load_or_default(config_path);
    let db_path = &config.storage.database;

    if !db_path.exists() {
        debug!(db_path = %db_path.display(), "No database found");
        return Ok(None);
    }

    let pool = DatabasePool::open_existing(db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    Ok(Some(SqliteSyncStore::new(pool.pool().clone())))
}
