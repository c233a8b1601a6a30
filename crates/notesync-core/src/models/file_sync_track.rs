//! Attachment transfer mapping model

use serde::{Deserialize, Serialize};

/// Maps a local attachment file to the remote object it was transferred
/// to or from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSyncTrack {
    pub local_path: String,
    /// Remote object key (without the `blob://` scheme)
    pub remote_key: String,
    /// Remote document id of the owning note
    pub doc_id: String,
    /// When the transfer finished (Unix ms)
    pub synced_at: i64,
}
