//! Note model

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::attachment::Attachment;

/// Local note identifier, owned by the local store.
pub type LocalId = i64;

/// Boolean note flags that travel with the note payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteFlags {
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
}

/// A note in the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Local identifier (0 until the store assigns one)
    pub id: LocalId,
    /// Title line
    pub title: String,
    /// Rich content as stored by the editor
    pub content: String,
    /// Plain text rendition used for previews
    pub plain_text: String,
    /// Pinned/archived flags
    pub flags: NoteFlags,
    /// Label set
    pub labels: BTreeSet<String>,
    /// Optional color name or hex value
    pub color: Option<String>,
    /// Reminder timestamp (Unix ms)
    pub reminder_at: Option<i64>,
    /// Attachments in display order
    pub attachments: Vec<Attachment>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Remote document id once the note has been pushed or pulled
    pub remote_id: Option<String>,
}

impl Note {
    /// Create an unsaved note with the given title and content
    #[must_use]
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let content = content.into();
        Self {
            id: 0,
            title: title.into(),
            plain_text: content.clone(),
            content,
            flags: NoteFlags::default(),
            labels: BTreeSet::new(),
            color: None,
            reminder_at: None,
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
            remote_id: None,
        }
    }

    /// Get the title, or the first content line, truncated to `max_len` characters
    #[must_use]
    pub fn title_preview(&self, max_len: usize) -> String {
        let source = if self.title.trim().is_empty() {
            self.plain_text.lines().next().unwrap_or("")
        } else {
            self.title.as_str()
        };
        source.trim().chars().take(max_len).collect()
    }

    /// Check if the note has neither title nor content
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty() && self.content.trim().is_empty() && self.attachments.is_empty()
    }

    /// Local attachment paths (remote references excluded)
    pub fn local_attachment_paths(&self) -> impl Iterator<Item = &str> {
        self.attachments
            .iter()
            .filter(|attachment| !attachment.is_remote())
            .map(|attachment| attachment.path.as_str())
    }
}
