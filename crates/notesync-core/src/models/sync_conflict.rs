//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::note::LocalId;

/// Strategy name recorded when a local note outlived a newer remote version.
pub const STRATEGY_KEEP_LOCAL: &str = "keep_local";

/// Strategy name recorded when a remote tombstone removed a newer local edit.
pub const STRATEGY_REMOTE_TOMBSTONE: &str = "remote_tombstone";

/// Recorded sync conflict resolved by the last-write-wins policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier (0 until stored)
    pub id: i64,
    /// Local note involved in the conflict
    pub note_id: LocalId,
    /// Remote document involved in the conflict
    pub remote_id: String,
    /// Local timestamp when the conflict occurred (Unix ms)
    pub local_updated_at: i64,
    /// Remote timestamp (Unix ms)
    pub incoming_updated_at: i64,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
