//! Conflict resolution between a local note and an incoming remote document.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//!
//! 1. Remote tombstones delete the local note, unless the local side holds an
//!    unsynced delete of a note that never reached the remote store.
//! 2. Encrypted payloads are deferred while encryption is not ready.
//! 3. Unsynced local edits keep the local version.
//! 4. A local note at least as new as the remote document is kept.
//! 5. Otherwise the remote document is applied.

use chrono::{DateTime, Utc};

use crate::models::{
    Note, PendingLocalChange, RemoteNoteDocument, SyncConflict, STRATEGY_KEEP_LOCAL,
    STRATEGY_REMOTE_TOMBSTONE,
};
use crate::util::unix_millis_now;

/// What to do with one incoming remote document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    ApplyRemote,
    KeepLocal,
    DeleteLocal,
    /// Leave the entry cached until encryption becomes ready
    DeferUndecryptable,
}

/// Decide how to reconcile `remote` with the local state of the same note.
#[must_use]
pub fn resolve(
    local: Option<&Note>,
    pending: Option<&PendingLocalChange>,
    remote: &RemoteNoteDocument,
    encryption_ready: bool,
) -> Resolution {
    if remote.is_tombstone() {
        return if pending.is_some_and(PendingLocalChange::is_local_only_delete) {
            Resolution::KeepLocal
        } else {
            Resolution::DeleteLocal
        };
    }

    if remote.is_encrypted() && !encryption_ready {
        return Resolution::DeferUndecryptable;
    }

    if pending.is_some_and(|change| change.status.is_unsynced()) {
        return Resolution::KeepLocal;
    }

    if local.is_some_and(|note| note.updated_at >= remote.updated_at_millis()) {
        return Resolution::KeepLocal;
    }

    Resolution::ApplyRemote
}

/// Tombstones are meaningless before the first completed sync: there is no
/// local copy they could refer to.
#[must_use]
pub fn skip_on_initial_sync(watermark: Option<DateTime<Utc>>, remote: &RemoteNoteDocument) -> bool {
    watermark.is_none() && remote.is_tombstone()
}

/// Conflict log entry for resolutions that discarded a newer version.
///
/// Only two cases are recorded: a pending local edit kept over a strictly
/// newer remote document, and a local edit newer than the tombstone that
/// deleted it.
#[must_use]
pub fn conflict_for(
    resolution: Resolution,
    local: &Note,
    remote_id: &str,
    remote: &RemoteNoteDocument,
) -> Option<SyncConflict> {
    let incoming = remote.updated_at_millis();
    let strategy = match resolution {
        Resolution::KeepLocal if !remote.is_tombstone() && local.updated_at < incoming => {
            STRATEGY_KEEP_LOCAL
        }
        Resolution::DeleteLocal if local.updated_at > incoming => STRATEGY_REMOTE_TOMBSTONE,
        _ => return None,
    };

    Some(SyncConflict {
        id: 0,
        note_id: local.id,
        remote_id: remote_id.to_string(),
        local_updated_at: local.updated_at,
        incoming_updated_at: incoming,
        resolved_at: unix_millis_now(),
        strategy: strategy.to_string(),
    })
}
