//! mailsync core - Domain logic and ports for the sync scheduler
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `SyncJob`, `FolderSyncState`, `PendingAction`, `AccountStatus`
//! - **Port definitions** - Traits for adapters: `ISyncStore`, `IMailProvider`,
//!   `ITokenProvider`, `IHostScheduler`, `IUserPreferences`, `IClock`
//! - **Configuration** - YAML-backed settings for the scheduler
//!
//! # Architecture
//!
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.
//! The scheduler itself lives in `mailsync-sync` and drives domain entities
//! through these ports.

pub mod config;
pub mod domain;
pub mod ports;
