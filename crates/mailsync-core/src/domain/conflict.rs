//! Last-write-wins conflict policy
//!
//! Concurrent local and remote mutations of the same message are not merged.
//! Every write is stamped with the wall-clock time it was applied; when a
//! write reaches a row that already carries a newer stamp, the stored row is
//! kept and the incoming write is discarded.

use chrono::{DateTime, Utc};

/// Which side of a conflicting write survives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The row already in the store
    Stored,
    /// The write being applied
    Incoming,
}

/// Resolves a write conflict by application timestamp
///
/// Equal stamps resolve to the incoming write, since it is the later
/// application of the two.
pub fn last_write_wins(stored_applied_at: DateTime<Utc>, incoming_applied_at: DateTime<Utc>) -> Winner {
    if incoming_applied_at >= stored_applied_at {
        Winner::Incoming
    } else {
        Winner::Stored
    }
}
