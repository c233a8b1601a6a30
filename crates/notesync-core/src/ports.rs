//! Collaborator interfaces consumed by the sync engine.
//!
//! The engine never talks to a concrete database, cloud SDK or file system
//! directly; it is handed implementations of these traits. `DatabaseService`
//! covers the local store, the `storage` and `remote` modules provide blob,
//! document and file system backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{
    Attachment, FileSyncTrack, LocalId, Note, PendingLocalChange, SyncConflict, SyncTrackStatus,
};
use crate::Result;

/// Local note store keyed by local integer id.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn get_note(&self, id: LocalId) -> Result<Option<Note>>;

    async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<Note>>;

    /// Insert (when `note.id == 0`) or replace a note applied from the remote
    /// store. Does not create a ledger row.
    async fn save_note(&self, note: &Note) -> Result<Note>;

    /// Remove a note applied as deleted from the remote store.
    async fn delete_note(&self, id: LocalId) -> Result<()>;

    async fn set_remote_id(&self, id: LocalId, remote_id: &str) -> Result<()>;

    async fn set_attachments(&self, id: LocalId, attachments: &[Attachment]) -> Result<()>;

    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<()>;
}

/// Pending-change ledger plus small persisted sync state.
#[async_trait]
pub trait ChangeLedger: Send + Sync {
    /// All rows, or only the ones whose status is not `synced`.
    async fn list_changes(&self, pending_only: bool) -> Result<Vec<PendingLocalChange>>;

    async fn get_change(&self, local_id: LocalId) -> Result<Option<PendingLocalChange>>;

    async fn save_change(&self, change: &PendingLocalChange) -> Result<()>;

    async fn update_status(
        &self,
        local_id: LocalId,
        status: SyncTrackStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<()>;

    /// Remove the row if no edit newer than `synced_through` (Unix ms) was
    /// recorded. Returns `false` when a newer edit is waiting.
    async fn complete_change(&self, local_id: LocalId, synced_through: i64) -> Result<bool>;

    async fn delete_change(&self, local_id: LocalId) -> Result<()>;

    async fn load_state(&self, key: &str) -> Result<Option<String>>;

    async fn save_state(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// Local ↔ remote attachment mappings.
#[async_trait]
pub trait FileTrackStore: Send + Sync {
    async fn get_by_local_path(&self, local_path: &str) -> Result<Option<FileSyncTrack>>;

    async fn get_by_remote_path(&self, remote_key: &str) -> Result<Option<FileSyncTrack>>;

    async fn save_track(&self, track: &FileSyncTrack) -> Result<()>;

    async fn delete_track(&self, local_path: &str) -> Result<()>;
}

/// Opaque encryption capability keyed by the account's master key.
#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Fails with `Error::EncryptionNotReady` while not ready.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails with `Error::EncryptionNotReady` while not ready and
    /// `Error::Decryption` on invalid ciphertext.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Cheap check whether bytes carry this provider's ciphertext framing.
    fn looks_encrypted(&self, data: &[u8]) -> bool;
}

/// Subscription tier check.
pub trait EntitlementProvider: Send + Sync {
    fn is_paid(&self) -> bool;
}

/// Signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    /// Account class that may not sync at all
    pub restricted: bool,
}

pub trait SessionProvider: Send + Sync {
    fn current_session(&self) -> Option<Session>;
}

/// Raw remote document as returned by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub data: serde_json::Value,
}

/// Position in the `(updated_at, id)` ordering of remote documents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentCursor {
    pub updated_at: DateTime<Utc>,
    pub doc_id: String,
}

/// `where updated_at > after order by (updated_at, id) limit N`, resuming
/// strictly after `start_after` when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeQuery {
    pub after: Option<DateTime<Utc>>,
    pub start_after: Option<DocumentCursor>,
    pub limit: usize,
}

/// One merge write inside a batched commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub doc_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Entry of a live change feed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub document: RemoteDocument,
}

/// Document-oriented remote store, scoped to the signed-in account.
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    fn new_document_id(&self) -> String;

    async fn get(&self, doc_id: &str) -> Result<Option<RemoteDocument>>;

    /// Shallow merge of top-level fields into the document.
    async fn set_merge(&self, doc_id: &str, data: serde_json::Value) -> Result<()>;

    /// Apply all writes atomically.
    async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<()>;

    async fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<RemoteDocument>>;

    /// Live feed of batches of documents with `updated_at > after`. The feed
    /// ends when the receiver is dropped.
    async fn subscribe(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Result<mpsc::Receiver<Vec<RemoteChange>>>;
}

/// Binary object store for attachment payloads.
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fails with `Error::ObjectNotFound` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Byte-oriented platform file system.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Creates missing parent directories.
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    /// Deleting a missing file is not an error.
    async fn delete(&self, path: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Files directly inside `dir`; empty when `dir` does not exist.
    async fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    fn documents_dir(&self) -> PathBuf;
}
