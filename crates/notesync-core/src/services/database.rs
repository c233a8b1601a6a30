//! Shared database service wrapper used across clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::{
    Database, LibSqlNoteRepository, LibSqlStateRepository, LibSqlSyncTrackRepository,
    NoteRepository, StateRepository, SyncTrackRepository,
};
use crate::models::{
    Attachment, FileSyncTrack, LocalId, Note, PendingLocalChange, SyncAction, SyncConflict,
    SyncTrackStatus,
};
use crate::ports::{ChangeLedger, FileTrackStore, NoteStore};
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Thread-safe service for DB and repository operations.
///
/// Local edits made through this service always leave a `pending` row in the
/// change ledger so the next push picks them up.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh one is created.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn is_corrupted_db_error(error: &Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };

        if db_path.exists() {
            let timestamp = unix_millis_now();
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale database sidecar file {}", path.display());
            }
        }

        Ok(())
    }

    /// List notes, pinned first then newest first.
    pub async fn list_notes(&self, limit: usize, offset: usize) -> Result<Vec<Note>> {
        let db = self.db.lock().await;
        let repo = LibSqlNoteRepository::new(db.connection());
        repo.list(limit, offset).await
    }

    /// Fetch a note by id.
    pub async fn get_note(&self, id: LocalId) -> Result<Option<Note>> {
        let db = self.db.lock().await;
        let repo = LibSqlNoteRepository::new(db.connection());
        repo.get(id).await
    }

    /// Create a note from local input.
    pub async fn create_note(&self, note: &Note) -> Result<Note> {
        if note.is_empty() {
            return Err(Error::InvalidInput("Note cannot be empty".to_string()));
        }

        let now = unix_millis_now();
        let mut note = note.clone();
        note.id = 0;
        note.created_at = now;
        note.updated_at = now;

        let db = self.db.lock().await;
        let stored = LibSqlNoteRepository::new(db.connection()).insert(&note).await?;
        LibSqlSyncTrackRepository::new(db.connection())
            .record_edit(&PendingLocalChange::new(stored.id, SyncAction::Upload, now))
            .await?;
        Ok(stored)
    }

    /// Save local edits to an existing note.
    pub async fn update_note(&self, note: &Note) -> Result<Note> {
        let db = self.db.lock().await;
        let notes = LibSqlNoteRepository::new(db.connection());
        let existing = notes
            .get(note.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("note {}", note.id)))?;

        let mut updated = note.clone();
        updated.created_at = existing.created_at;
        updated.remote_id = existing.remote_id.clone();
        updated.updated_at = unix_millis_now().max(existing.updated_at + 1);
        notes.update(&updated).await?;

        let mut change = PendingLocalChange::new(updated.id, SyncAction::Upload, updated.updated_at);
        change.remote_id = existing.remote_id;
        LibSqlSyncTrackRepository::new(db.connection())
            .record_edit(&change)
            .await?;
        Ok(updated)
    }

    /// Delete a note locally and queue the remote tombstone.
    pub async fn delete_note(&self, id: LocalId) -> Result<()> {
        let db = self.db.lock().await;
        let notes = LibSqlNoteRepository::new(db.connection());
        let existing = notes
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("note {id}")))?;

        let mut change = PendingLocalChange::new(
            id,
            SyncAction::Delete,
            unix_millis_now().max(existing.updated_at + 1),
        );
        change.remote_id = existing.remote_id;
        LibSqlSyncTrackRepository::new(db.connection())
            .record_edit(&change)
            .await?;
        notes.delete(id).await
    }

    /// List recently resolved sync conflicts.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlNoteRepository::new(db.connection());
        repo.list_conflicts(limit).await
    }
}

#[async_trait]
impl NoteStore for DatabaseService {
    async fn get_note(&self, id: LocalId) -> Result<Option<Note>> {
        Self::get_note(self, id).await
    }

    async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<Note>> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .get_by_remote_id(remote_id)
            .await
    }

    async fn save_note(&self, note: &Note) -> Result<Note> {
        let db = self.db.lock().await;
        let repo = LibSqlNoteRepository::new(db.connection());
        if note.id == 0 {
            repo.insert(note).await
        } else {
            repo.update(note).await?;
            Ok(note.clone())
        }
    }

    async fn delete_note(&self, id: LocalId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection()).delete(id).await
    }

    async fn set_remote_id(&self, id: LocalId, remote_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .set_remote_id(id, Some(remote_id))
            .await
    }

    async fn set_attachments(&self, id: LocalId, attachments: &[Attachment]) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .set_attachments(id, attachments)
            .await
    }

    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlNoteRepository::new(db.connection())
            .record_conflict(conflict)
            .await
    }
}

#[async_trait]
impl ChangeLedger for DatabaseService {
    async fn list_changes(&self, pending_only: bool) -> Result<Vec<PendingLocalChange>> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .list(pending_only)
            .await
    }

    async fn get_change(&self, local_id: LocalId) -> Result<Option<PendingLocalChange>> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .get(local_id)
            .await
    }

    async fn save_change(&self, change: &PendingLocalChange) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .upsert(change)
            .await
    }

    async fn update_status(
        &self,
        local_id: LocalId,
        status: SyncTrackStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .update_status(local_id, status, last_error)
            .await
    }

    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .assign_remote_id(local_id, remote_id)
            .await
    }

    async fn complete_change(&self, local_id: LocalId, synced_through: i64) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .complete(local_id, synced_through)
            .await
    }

    async fn delete_change(&self, local_id: LocalId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .delete(local_id)
            .await
    }

    async fn load_state(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection()).get(key).await
    }

    async fn save_state(&self, key: &str, value: Option<&str>) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlStateRepository::new(db.connection())
            .set(key, value)
            .await
    }
}

#[async_trait]
impl FileTrackStore for DatabaseService {
    async fn get_by_local_path(&self, local_path: &str) -> Result<Option<FileSyncTrack>> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .get_file_track(local_path)
            .await
    }

    async fn get_by_remote_path(&self, remote_key: &str) -> Result<Option<FileSyncTrack>> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .get_file_track_by_remote(remote_key)
            .await
    }

    async fn save_track(&self, track: &FileSyncTrack) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .save_file_track(track)
            .await
    }

    async fn delete_track(&self, local_path: &str) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSyncTrackRepository::new(db.connection())
            .delete_file_track(local_path)
            .await
    }
}
