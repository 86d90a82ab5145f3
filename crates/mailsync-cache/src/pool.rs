//! SQLite pool for the sync store
//!
//! One database file per installation, opened in WAL mode so the `mailsync`
//! inspection commands can read while the scheduler commits. The schema
//! version lives in `PRAGMA user_version`: the scheduler migrates the store
//! when it opens it, while read-side tooling only accepts a store that is
//! already at [`SCHEMA_VERSION`].

use std::{path::Path, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::CacheError;

/// Schema version this build reads and writes
pub const SCHEMA_VERSION: i64 = 1;

/// Ordered migrations; each brings the store up to its version
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("migrations/0001_initial.sql"))];

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool over the sync store database
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens the store at `db_path`, creating and migrating it as needed
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` when the directory or file cannot be
    /// opened, `CacheError::MigrationFailed` when the store was written by a
    /// newer schema or a migration fails.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Cannot create store directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let pool = connect(db_path, true).await?;
        let from_version = migrate(&pool).await?;

        info!(
            path = %db_path.display(),
            from_version,
            schema_version = SCHEMA_VERSION,
            "Sync store opened"
        );
        Ok(Self { pool })
    }

    /// Opens a store the scheduler already created, without migrating it
    ///
    /// Fails rather than creating an empty store at a mistyped path, and
    /// rejects a store whose schema version differs from this build's.
    pub async fn open_existing(db_path: &Path) -> Result<Self, CacheError> {
        if !db_path.exists() {
            return Err(CacheError::ConnectionFailed(format!(
                "No sync store at {}",
                db_path.display()
            )));
        }

        let pool = connect(db_path, false).await?;
        let version = schema_version(&pool).await?;
        if version != SCHEMA_VERSION {
            pool.close().await;
            return Err(CacheError::MigrationFailed(format!(
                "Sync store at {} has schema version {version}, this build reads version {SCHEMA_VERSION}",
                db_path.display()
            )));
        }

        debug!(path = %db_path.display(), "Existing sync store opened");
        Ok(Self { pool })
    }

    /// Creates a migrated in-memory store
    ///
    /// An in-memory SQLite database belongs to a single connection, so the
    /// pool holds exactly one.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Cannot create in-memory store: {e}"))
            })?;

        migrate(&pool).await?;
        debug!("In-memory sync store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Schema version recorded in the store
    pub async fn schema_version(&self) -> Result<i64, CacheError> {
        schema_version(&self.pool).await
    }
}

async fn connect(db_path: &Path, create: bool) -> Result<SqlitePool, CacheError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| {
            CacheError::ConnectionFailed(format!(
                "Cannot open sync store at {}: {e}",
                db_path.display()
            ))
        })
}

async fn schema_version(pool: &SqlitePool) -> Result<i64, CacheError> {
    sqlx::query_scalar::<_, i64>("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| CacheError::QueryFailed(format!("Cannot read schema version: {e}")))
}

/// Applies every migration above the recorded version
///
/// Returns the version the store had before migrating.
async fn migrate(pool: &SqlitePool) -> Result<i64, CacheError> {
    let current = schema_version(pool).await?;
    if current > SCHEMA_VERSION {
        return Err(CacheError::MigrationFailed(format!(
            "Store schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > current) {
        let script = format!("{sql}\nPRAGMA user_version = {version};");
        sqlx::raw_sql(&script).execute(pool).await.map_err(|e| {
            CacheError::MigrationFailed(format!("Migration to schema version {version} failed: {e}"))
        })?;
        debug!(version, "Store migration applied");
    }
    Ok(current)
}
