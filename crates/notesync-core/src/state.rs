//! Observable sync state shared with UI layers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::LocalId;

/// Coarse sync indicator for status bars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Phase of the current sync session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Pushing,
    Fetching,
    Draining,
}

/// Snapshot published on every state change of the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Transient human readable message ("Fetching…", "2 notes failed to sync")
    pub message: Option<String>,
    pub synced_count: usize,
    pub total_count: usize,
    /// Notes whose last sync attempt failed
    pub failed: BTreeSet<LocalId>,
    /// Notes currently being pushed or applied
    pub in_flight: BTreeSet<LocalId>,
    /// Watermark of the remote change feed
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether every gate needed to receive changes is open
    pub online: bool,
}

impl SyncStatus {
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.phase != SyncPhase::Idle
    }

    /// `(synced, total)` progress pair of the running phase.
    #[must_use]
    pub const fn progress(&self) -> (usize, usize) {
        (self.synced_count, self.total_count)
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        if self.is_syncing() {
            SyncState::Syncing
        } else if !self.online {
            SyncState::Offline
        } else if self.failed.is_empty() {
            SyncState::Synced
        } else {
            SyncState::Error
        }
    }
}

/// Outcome of one sync pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Pass did not run because another one was in progress or gates were closed
    pub skipped: bool,
    pub pushed: usize,
    /// Remote documents written locally
    pub applied: usize,
    /// Local notes removed because of remote tombstones
    pub deleted: usize,
    /// Remote entries kept for later because encryption is not ready
    pub deferred: usize,
    pub failed: BTreeSet<LocalId>,
}

impl SyncReport {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Discrete events published alongside status snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    NoteApplied(LocalId),
    NoteDeleted(LocalId),
    NoteFailed { local_id: LocalId, error: String },
    /// Remote state was reset (user switch or encryption became ready)
    Reset,
    Finished(SyncReport),
}
