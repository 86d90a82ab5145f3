//! Configuration module for mailsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::FolderRole;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for mailsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub backoff: BackoffConfig,
    pub outbox: OutboxConfig,
    pub polling: PollingConfig,
    pub initial_sync: InitialSyncConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Execution deadline of a single job, in seconds. Exceeding it counts
    /// as a transient network failure.
    pub job_timeout_secs: u64,
    /// Buffered status snapshots per subscriber before it starts lagging.
    pub status_channel_capacity: usize,
}

/// Per-account exponential backoff after failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Interval after the first failure, in milliseconds.
    pub base_ms: u64,
    /// Upper bound of the interval, in seconds.
    pub max_secs: u64,
}

/// Outbox (pending action) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Upload attempts before an action is marked failed and surfaced.
    pub max_attempts: u32,
}

/// Polling lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between refresh ticks while the app is in the foreground.
    pub active_interval_secs: u64,
    /// Minutes between host periodic wakes while in the background.
    pub passive_wake_minutes: u64,
    /// Hours between folder list refreshes.
    pub folder_list_interval_hours: u64,
    /// Folder roles refreshed on every tick and required for initial sync.
    pub critical_roles: Vec<FolderRole>,
}

/// First-sync settings for newly added accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialSyncConfig {
    /// Days of history when the user has not chosen a value.
    pub default_duration_days: u32,
    /// Wall-time guard after which initial sync ends regardless of progress.
    pub max_duration_minutes: u64,
}

/// Message body cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-account body cache size that triggers eviction, in MiB.
    pub max_size_mb: u64,
    /// Eviction target as a percentage of `max_size_mb` (1-100).
    pub evict_target_percent: u8,
}

/// Local database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub database: PathBuf,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/mailsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("mailsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Derived durations
// ---------------------------------------------------------------------------

impl SchedulerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

impl PollingConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs)
    }

    pub fn passive_wake_interval(&self) -> Duration {
        Duration::from_secs(self.passive_wake_minutes * 60)
    }

    pub fn folder_list_interval(&self) -> Duration {
        Duration::from_secs(self.folder_list_interval_hours * 3600)
    }

    pub fn is_critical(&self, role: FolderRole) -> bool {
        self.critical_roles.contains(&role)
    }
}

impl InitialSyncConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_minutes * 60)
    }
}

impl CacheConfig {
    /// Size above which eviction is scheduled, in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    /// Size eviction brings the cache down to, in bytes
    pub fn target_size_bytes(&self) -> u64 {
        self.max_size_bytes() / 100 * u64::from(self.evict_target_percent)
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 60,
            status_channel_capacity: 64,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_secs: 900,
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_interval_secs: 60,
            passive_wake_minutes: 15,
            folder_list_interval_hours: 24,
            critical_roles: vec![FolderRole::Inbox, FolderRole::Sent, FolderRole::Drafts],
        }
    }
}

impl Default for InitialSyncConfig {
    fn default() -> Self {
        Self {
            default_duration_days: 30,
            max_duration_minutes: 30,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 512,
            evict_target_percent: 80,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("mailsync")
                .join("mailsync.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"backoff.base_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn must_be_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- scheduler ---
        must_be_positive(
            &mut errors,
            "scheduler.job_timeout_secs",
            self.scheduler.job_timeout_secs,
        );
        must_be_positive(
            &mut errors,
            "scheduler.status_channel_capacity",
            self.scheduler.status_channel_capacity as u64,
        );

        // --- backoff ---
        must_be_positive(&mut errors, "backoff.base_ms", self.backoff.base_ms);
        must_be_positive(&mut errors, "backoff.max_secs", self.backoff.max_secs);
        if self.backoff.max() < self.backoff.base() {
            errors.push(ValidationError {
                field: "backoff.max_secs".into(),
                message: format!(
                    "max_secs ({}) must not be shorter than base_ms ({})",
                    self.backoff.max_secs, self.backoff.base_ms
                ),
            });
        }

        // --- outbox ---
        must_be_positive(
            &mut errors,
            "outbox.max_attempts",
            u64::from(self.outbox.max_attempts),
        );

        // --- polling ---
        must_be_positive(
            &mut errors,
            "polling.active_interval_secs",
            self.polling.active_interval_secs,
        );
        must_be_positive(
            &mut errors,
            "polling.passive_wake_minutes",
            self.polling.passive_wake_minutes,
        );
        must_be_positive(
            &mut errors,
            "polling.folder_list_interval_hours",
            self.polling.folder_list_interval_hours,
        );
        if self.polling.critical_roles.is_empty() {
            errors.push(ValidationError {
                field: "polling.critical_roles".into(),
                message: "must name at least one folder role".into(),
            });
        }

        // --- initial_sync ---
        must_be_positive(
            &mut errors,
            "initial_sync.default_duration_days",
            u64::from(self.initial_sync.default_duration_days),
        );
        must_be_positive(
            &mut errors,
            "initial_sync.max_duration_minutes",
            self.initial_sync.max_duration_minutes,
        );

        // --- cache ---
        must_be_positive(&mut errors, "cache.max_size_mb", self.cache.max_size_mb);
        if self.cache.evict_target_percent == 0 || self.cache.evict_target_percent > 100 {
            errors.push(ValidationError {
                field: "cache.evict_target_percent".into(),
                message: "must be in range 1..=100".into(),
            });
        }

        // --- storage ---
        if self.storage.database.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.database".into(),
                message: "must not be empty".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use mailsync_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .backoff_base_ms(500)
///     .outbox_max_attempts(5)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- scheduler ---

    pub fn scheduler_job_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.scheduler.job_timeout_secs = seconds;
        self
    }

    pub fn scheduler_status_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.scheduler.status_channel_capacity = capacity;
        self
    }

    // --- backoff ---

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.config.backoff.base_ms = ms;
        self
    }

    pub fn backoff_max_secs(mut self, seconds: u64) -> Self {
        self.config.backoff.max_secs = seconds;
        self
    }

    // --- outbox ---

    pub fn outbox_max_attempts(mut self, n: u32) -> Self {
        self.config.outbox.max_attempts = n;
        self
    }

    // --- polling ---

    pub fn polling_active_interval_secs(mut self, seconds: u64) -> Self {
        self.config.polling.active_interval_secs = seconds;
        self
    }

    pub fn polling_passive_wake_minutes(mut self, minutes: u64) -> Self {
        self.config.polling.passive_wake_minutes = minutes;
        self
    }

    pub fn polling_folder_list_interval_hours(mut self, hours: u64) -> Self {
        self.config.polling.folder_list_interval_hours = hours;
        self
    }

    pub fn polling_critical_roles(mut self, roles: Vec<FolderRole>) -> Self {
        self.config.polling.critical_roles = roles;
        self
    }

    // --- initial_sync ---

    pub fn initial_sync_default_duration_days(mut self, days: u32) -> Self {
        self.config.initial_sync.default_duration_days = days;
        self
    }

    pub fn initial_sync_max_duration_minutes(mut self, minutes: u64) -> Self {
        self.config.initial_sync.max_duration_minutes = minutes;
        self
    }

    // --- cache ---

    pub fn cache_max_size_mb(mut self, mb: u64) -> Self {
        self.config.cache.max_size_mb = mb;
        self
    }

    pub fn cache_evict_target_percent(mut self, percent: u8) -> Self {
        self.config.cache.evict_target_percent = percent;
        self
    }

    // --- storage ---

    pub fn storage_database(mut self, path: PathBuf) -> Self {
        self.config.storage.database = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
