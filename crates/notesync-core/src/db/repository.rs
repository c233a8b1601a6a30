//! Note repository implementation

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::models::{Attachment, LocalId, Note, NoteFlags, SyncConflict};
use libsql::{Connection, Row, Value};

const NOTE_COLUMNS: &str = "id, title, content, plain_text, pinned, archived, labels, color, \
                            reminder_at, attachments, created_at, updated_at, remote_id";

/// Trait for note storage operations (async)
#[allow(async_fn_in_trait)]
pub trait NoteRepository {
    /// Insert a note and return it with its assigned id
    async fn insert(&self, note: &Note) -> Result<Note>;

    /// Get a note by id
    async fn get(&self, id: LocalId) -> Result<Option<Note>>;

    /// Get a note by its remote document id
    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Note>>;

    /// List notes newest first
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Note>>;

    /// Replace every field of an existing note
    async fn update(&self, note: &Note) -> Result<()>;

    /// Set only the remote document id of a note
    async fn set_remote_id(&self, id: LocalId, remote_id: Option<&str>) -> Result<()>;

    /// Replace only the attachment list of a note
    async fn set_attachments(&self, id: LocalId, attachments: &[Attachment]) -> Result<()>;

    /// Permanently delete a note
    async fn delete(&self, id: LocalId) -> Result<()>;

    /// Store a resolved conflict
    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<()>;

    /// List recently resolved conflicts
    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// libSQL implementation of `NoteRepository`
pub struct LibSqlNoteRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlNoteRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_one(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<Note>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(note_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

impl NoteRepository for LibSqlNoteRepository<'_> {
    async fn insert(&self, note: &Note) -> Result<Note> {
        let labels = serde_json::to_string(&note.labels)?;
        let attachments = serde_json::to_string(&note.attachments)?;

        self.conn
            .execute(
                "INSERT INTO notes (title, content, plain_text, pinned, archived, labels, color,
                                    reminder_at, attachments, created_at, updated_at, remote_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    note.title.as_str(),
                    note.content.as_str(),
                    note.plain_text.as_str(),
                    i64::from(note.flags.pinned),
                    i64::from(note.flags.archived),
                    labels,
                    opt_text(note.color.as_deref()),
                    opt_integer(note.reminder_at),
                    attachments,
                    note.created_at,
                    note.updated_at,
                    opt_text(note.remote_id.as_deref()),
                ],
            )
            .await?;

        let mut stored = note.clone();
        stored.id = self.conn.last_insert_rowid();
        Ok(stored)
    }

    async fn get(&self, id: LocalId) -> Result<Option<Note>> {
        self.query_one(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?"), [id])
            .await
    }

    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Note>> {
        self.query_one(
            &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE remote_id = ?"),
            [remote_id],
        )
        .await
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Note>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {NOTE_COLUMNS} FROM notes
                     ORDER BY pinned DESC, updated_at DESC, id DESC
                     LIMIT ? OFFSET ?"
                ),
                [limit, offset],
            )
            .await?;

        let mut notes = Vec::new();
        while let Some(row) = rows.next().await? {
            notes.push(note_from_row(&row)?);
        }
        Ok(notes)
    }

    async fn update(&self, note: &Note) -> Result<()> {
        let labels = serde_json::to_string(&note.labels)?;
        let attachments = serde_json::to_string(&note.attachments)?;

        let changed = self
            .conn
            .execute(
                "UPDATE notes SET title = ?, content = ?, plain_text = ?, pinned = ?, archived = ?,
                                  labels = ?, color = ?, reminder_at = ?, attachments = ?,
                                  updated_at = ?, remote_id = ?
                 WHERE id = ?",
                libsql::params![
                    note.title.as_str(),
                    note.content.as_str(),
                    note.plain_text.as_str(),
                    i64::from(note.flags.pinned),
                    i64::from(note.flags.archived),
                    labels,
                    opt_text(note.color.as_deref()),
                    opt_integer(note.reminder_at),
                    attachments,
                    note.updated_at,
                    opt_text(note.remote_id.as_deref()),
                    note.id,
                ],
            )
            .await?;

        if changed == 0 {
            return Err(Error::NotFound(format!("note {}", note.id)));
        }
        Ok(())
    }

    async fn set_remote_id(&self, id: LocalId, remote_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notes SET remote_id = ? WHERE id = ?",
                libsql::params![opt_text(remote_id), id],
            )
            .await?;
        Ok(())
    }

    async fn set_attachments(&self, id: LocalId, attachments: &[Attachment]) -> Result<()> {
        let attachments = serde_json::to_string(attachments)?;
        self.conn
            .execute(
                "UPDATE notes SET attachments = ? WHERE id = ?",
                libsql::params![attachments, id],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: LocalId) -> Result<()> {
        self.conn
            .execute("DELETE FROM notes WHERE id = ?", [id])
            .await?;
        Ok(())
    }

    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (note_id, remote_id, local_updated_at,
                                             incoming_updated_at, resolved_at, strategy)
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    conflict.note_id,
                    conflict.remote_id.as_str(),
                    conflict.local_updated_at,
                    conflict.incoming_updated_at,
                    conflict.resolved_at,
                    conflict.strategy.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT id, note_id, remote_id, local_updated_at, incoming_updated_at,
                        resolved_at, strategy
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
                [limit],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                note_id: row.get(1)?,
                remote_id: row.get(2)?,
                local_updated_at: row.get(3)?,
                incoming_updated_at: row.get(4)?,
                resolved_at: row.get(5)?,
                strategy: row.get(6)?,
            });
        }
        Ok(conflicts)
    }
}

fn note_from_row(row: &Row) -> Result<Note> {
    let labels: String = row.get(6)?;
    let attachments: String = row.get(9)?;

    Ok(Note {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        plain_text: row.get(3)?,
        flags: NoteFlags {
            pinned: row.get::<i64>(4)? != 0,
            archived: row.get::<i64>(5)? != 0,
        },
        labels: serde_json::from_str::<BTreeSet<String>>(&labels)?,
        color: text_column(row, 7)?,
        reminder_at: integer_column(row, 8)?,
        attachments: serde_json::from_str::<Vec<Attachment>>(&attachments)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        remote_id: text_column(row, 12)?,
    })
}

/// Nullable TEXT parameter
pub(crate) fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// Nullable INTEGER parameter
pub(crate) fn opt_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// Read a nullable TEXT column
pub(crate) fn text_column(row: &Row, index: i32) -> Result<Option<String>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::Database(format!(
            "expected TEXT in column {index}, found {other:?}"
        ))),
    }
}

/// Read a nullable INTEGER column
pub(crate) fn integer_column(row: &Row, index: i32) -> Result<Option<i64>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected INTEGER in column {index}, found {other:?}"
        ))),
    }
}
