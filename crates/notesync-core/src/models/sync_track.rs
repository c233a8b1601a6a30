//! Pending local change ledger ("sync track") model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::note::LocalId;

/// Outward action waiting to be pushed for a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Upload,
    Delete,
}

/// Push state of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrackStatus {
    Pending,
    InProgress,
    Synced,
    Failed,
}

impl SyncTrackStatus {
    /// Whether the row still represents an edit the remote has not seen.
    #[must_use]
    pub const fn is_unsynced(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

macro_rules! impl_sql_text {
    ($ty:ty, { $($variant:path => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($variant => $text,)+
                };
                f.write_str(text)
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "Unknown {} value: {other}",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

impl_sql_text!(SyncAction, {
    SyncAction::Upload => "upload",
    SyncAction::Delete => "delete",
});

impl_sql_text!(SyncTrackStatus, {
    SyncTrackStatus::Pending => "pending",
    SyncTrackStatus::InProgress => "in_progress",
    SyncTrackStatus::Synced => "synced",
    SyncTrackStatus::Failed => "failed",
});

/// One ledger row per local note with an unsynced outward edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLocalChange {
    pub local_id: LocalId,
    pub action: SyncAction,
    pub status: SyncTrackStatus,
    /// Remote document id, assigned before the first commit is attempted
    pub remote_id: Option<String>,
    /// When the local edit happened (Unix ms); bumped by every new edit
    pub updated_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl PendingLocalChange {
    #[must_use]
    pub fn new(local_id: LocalId, action: SyncAction, updated_at: i64) -> Self {
        Self {
            local_id,
            action,
            status: SyncTrackStatus::Pending,
            remote_id: None,
            updated_at,
            retry_count: 0,
            last_error: None,
        }
    }

    /// An unsynced delete for a note that never reached the remote store.
    #[must_use]
    pub fn is_local_only_delete(&self) -> bool {
        self.action == SyncAction::Delete && self.remote_id.is_none() && self.status.is_unsynced()
    }
}
