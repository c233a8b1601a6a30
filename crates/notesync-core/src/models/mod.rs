//! Data models for notesync

mod attachment;
mod file_sync_track;
mod note;
mod remote;
mod sync_conflict;
mod sync_track;

pub use attachment::{
    is_remote_reference, object_key_of, remote_reference, Attachment, AttachmentKind,
    RemoteAttachment, REMOTE_REF_SCHEME,
};
pub use file_sync_track::FileSyncTrack;
pub use note::{LocalId, Note, NoteFlags};
pub use remote::{NotePayload, RemoteNoteDocument, REMOTE_SCHEMA_VERSION};
pub use sync_conflict::{SyncConflict, STRATEGY_KEEP_LOCAL, STRATEGY_REMOTE_TOMBSTONE};
pub use sync_track::{PendingLocalChange, SyncAction, SyncTrackStatus};
