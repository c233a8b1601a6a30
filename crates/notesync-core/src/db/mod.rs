//! Local database layer for notesync

mod connection;
mod migrations;
mod repository;
mod state_repository;
mod sync_track_repository;

pub use connection::Database;
pub use repository::{LibSqlNoteRepository, NoteRepository};
pub use state_repository::{LibSqlStateRepository, StateRepository};
pub use sync_track_repository::{LibSqlSyncTrackRepository, SyncTrackRepository};
