//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the scheduler depends
//! on, but whose implementations live in adapter crates or in the host
//! application.
//!
//! ## Ports Overview
//!
//! - [`ISyncStore`] - Persistent sync state (cursors, outbox, messages)
//! - [`IMailProvider`] - Remote mail provider operations
//! - [`ITokenProvider`] - Access token acquisition and reauthentication
//! - [`IHostScheduler`] - Periodic wake and foreground execution
//! - [`IUserPreferences`] - User preferences read by the scheduler
//! - [`IClock`] - Wall-clock time

pub mod clock;
pub mod host;
pub mod mail_provider;
pub mod sync_store;
pub mod token_provider;

pub use clock::{IClock, ManualClock, SystemClock};
pub use host::{IHostScheduler, IUserPreferences};
pub use mail_provider::{HeaderPage, HeaderPageRequest, IMailProvider};
pub use sync_store::{ISyncStore, StoreMutation, SyncCommit};
pub use token_provider::{AccessToken, ITokenProvider};
