//! Pending-change ledger and attachment track repository

use crate::error::Result;
use crate::models::{FileSyncTrack, LocalId, PendingLocalChange, SyncTrackStatus};
use libsql::{Connection, Row};

use super::repository::{opt_text, text_column};

const TRACK_COLUMNS: &str = "local_id, action, status, remote_id, updated_at, retry_count, last_error";

/// Trait for the pending-change ledger and file track storage (async)
#[allow(async_fn_in_trait)]
pub trait SyncTrackRepository {
    /// List ledger rows, optionally only the ones not yet synced
    async fn list(&self, pending_only: bool) -> Result<Vec<PendingLocalChange>>;

    /// Get the ledger row of a note
    async fn get(&self, local_id: LocalId) -> Result<Option<PendingLocalChange>>;

    /// Insert or replace the ledger row of a note
    async fn upsert(&self, change: &PendingLocalChange) -> Result<()>;

    /// Record a new local edit, keeping any remote id already assigned
    async fn record_edit(&self, change: &PendingLocalChange) -> Result<()>;

    /// Update status fields only; `Failed` increments the retry counter
    async fn update_status(
        &self,
        local_id: LocalId,
        status: SyncTrackStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// Persist the remote id of a ledger row
    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<()>;

    /// Delete the row unless an edit newer than `synced_through` arrived
    async fn complete(&self, local_id: LocalId, synced_through: i64) -> Result<bool>;

    /// Delete the ledger row of a note
    async fn delete(&self, local_id: LocalId) -> Result<()>;

    /// Get the attachment mapping of a local file
    async fn get_file_track(&self, local_path: &str) -> Result<Option<FileSyncTrack>>;

    /// Get the attachment mapping of a remote object
    async fn get_file_track_by_remote(&self, remote_key: &str) -> Result<Option<FileSyncTrack>>;

    /// Insert or replace an attachment mapping
    async fn save_file_track(&self, track: &FileSyncTrack) -> Result<()>;

    /// Delete an attachment mapping
    async fn delete_file_track(&self, local_path: &str) -> Result<()>;
}

/// libSQL implementation of `SyncTrackRepository`
pub struct LibSqlSyncTrackRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncTrackRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn file_track_where(&self, column: &str, value: &str) -> Result<Option<FileSyncTrack>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT local_path, remote_key, doc_id, synced_at
                     FROM file_sync_track WHERE {column} = ? LIMIT 1"
                ),
                [value],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(FileSyncTrack {
                local_path: row.get(0)?,
                remote_key: row.get(1)?,
                doc_id: row.get(2)?,
                synced_at: row.get(3)?,
            })),
            None => Ok(None),
        }
    }
}

impl SyncTrackRepository for LibSqlSyncTrackRepository<'_> {
    async fn list(&self, pending_only: bool) -> Result<Vec<PendingLocalChange>> {
        let filter = if pending_only {
            "WHERE status != 'synced'"
        } else {
            ""
        };
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TRACK_COLUMNS} FROM sync_track {filter} ORDER BY updated_at, local_id"),
                (),
            )
            .await?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(change_from_row(&row)?);
        }
        Ok(changes)
    }

    async fn get(&self, local_id: LocalId) -> Result<Option<PendingLocalChange>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TRACK_COLUMNS} FROM sync_track WHERE local_id = ?"),
                [local_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(change_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, change: &PendingLocalChange) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_track
                    (local_id, action, status, remote_id, updated_at, retry_count, last_error)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    change.local_id,
                    change.action.to_string(),
                    change.status.to_string(),
                    opt_text(change.remote_id.as_deref()),
                    change.updated_at,
                    i64::from(change.retry_count),
                    opt_text(change.last_error.as_deref()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_edit(&self, change: &PendingLocalChange) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_track
                    (local_id, action, status, remote_id, updated_at, retry_count, last_error)
                 VALUES (?, ?, 'pending', ?, ?, 0, NULL)
                 ON CONFLICT(local_id) DO UPDATE SET
                    action = excluded.action,
                    status = 'pending',
                    remote_id = COALESCE(sync_track.remote_id, excluded.remote_id),
                    updated_at = MAX(sync_track.updated_at + 1, excluded.updated_at),
                    last_error = NULL",
                libsql::params![
                    change.local_id,
                    change.action.to_string(),
                    opt_text(change.remote_id.as_deref()),
                    change.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        local_id: LocalId,
        status: SyncTrackStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let retry_increment = i64::from(status == SyncTrackStatus::Failed);
        self.conn
            .execute(
                "UPDATE sync_track
                 SET status = ?, last_error = ?, retry_count = retry_count + ?
                 WHERE local_id = ?",
                libsql::params![
                    status.to_string(),
                    opt_text(last_error),
                    retry_increment,
                    local_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_track SET remote_id = ? WHERE local_id = ?",
                libsql::params![remote_id, local_id],
            )
            .await?;
        Ok(())
    }

    async fn complete(&self, local_id: LocalId, synced_through: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM sync_track WHERE local_id = ? AND updated_at <= ?",
                libsql::params![local_id, synced_through],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn delete(&self, local_id: LocalId) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_track WHERE local_id = ?", [local_id])
            .await?;
        Ok(())
    }

    async fn get_file_track(&self, local_path: &str) -> Result<Option<FileSyncTrack>> {
        self.file_track_where("local_path", local_path).await
    }

    async fn get_file_track_by_remote(&self, remote_key: &str) -> Result<Option<FileSyncTrack>> {
        self.file_track_where("remote_key", remote_key).await
    }

    async fn save_file_track(&self, track: &FileSyncTrack) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO file_sync_track (local_path, remote_key, doc_id, synced_at)
                 VALUES (?, ?, ?, ?)",
                libsql::params![
                    track.local_path.as_str(),
                    track.remote_key.as_str(),
                    track.doc_id.as_str(),
                    track.synced_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_file_track(&self, local_path: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM file_sync_track WHERE local_path = ?",
                [local_path],
            )
            .await?;
        Ok(())
    }
}

fn change_from_row(row: &Row) -> Result<PendingLocalChange> {
    let action: String = row.get(1)?;
    let status: String = row.get(2)?;
    let retry_count: i64 = row.get(5)?;

    Ok(PendingLocalChange {
        local_id: row.get(0)?,
        action: action.parse()?,
        status: status.parse()?,
        remote_id: text_column(row, 3)?,
        updated_at: row.get(4)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error: text_column(row, 6)?,
    })
}
