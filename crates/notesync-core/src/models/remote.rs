//! Remote note document schema
//!
//! Documents are versioned. Schema 1 documents predate the `schema_version`
//! field and carried plaintext note fields at the top level; they are
//! migrated to the current shape on read.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::attachment::RemoteAttachment;
use super::note::{LocalId, NoteFlags};

/// Current remote document schema version.
pub const REMOTE_SCHEMA_VERSION: u32 = 2;

/// Note fields that travel inside a remote document (plain or encrypted).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub plain_text: String,
    #[serde(default)]
    pub flags: NoteFlags,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub reminder_at: Option<i64>,
}

/// A note as stored in the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNoteDocument {
    pub schema_version: u32,
    /// Back-reference to the local id on the device that created the note
    pub local_id: LocalId,
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag. Missing is not the same as `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    /// Plaintext payload, written when encryption is unavailable
    #[serde(default)]
    pub payload: Option<NotePayload>,
    /// Base64 ciphertext of the JSON encoded [`NotePayload`]
    #[serde(default)]
    pub encrypted_payload: Option<String>,
    #[serde(default)]
    pub attachments: Vec<RemoteAttachment>,
}

impl RemoteNoteDocument {
    /// Build a tombstone document.
    #[must_use]
    pub const fn tombstone(local_id: LocalId, updated_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: REMOTE_SCHEMA_VERSION,
            local_id,
            updated_at,
            deleted: Some(true),
            payload: None,
            encrypted_payload: None,
            attachments: Vec::new(),
        }
    }

    /// Whether this document represents a deletion.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.deleted == Some(true)
    }

    /// Whether the payload needs the encryption subsystem to be read.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encrypted_payload.is_some()
    }

    /// `updated_at` as Unix milliseconds, comparable to local timestamps.
    #[must_use]
    pub const fn updated_at_millis(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }

    /// Parse a stored document, migrating older schema versions.
    pub fn from_value(doc_id: &str, value: serde_json::Value) -> Result<Self> {
        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);

        match version {
            1 => {
                let legacy: LegacyRemoteNoteV1 =
                    serde_json::from_value(value).map_err(|error| invalid(doc_id, &error))?;
                Ok(legacy.migrate())
            }
            2 => serde_json::from_value(value).map_err(|error| invalid(doc_id, &error)),
            other => Err(Error::InvalidDocument {
                doc_id: doc_id.to_string(),
                reason: format!("unsupported schema_version {other}"),
            }),
        }
    }

    /// Serialize for a merge write.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn invalid(doc_id: &str, error: &serde_json::Error) -> Error {
    Error::InvalidDocument {
        doc_id: doc_id.to_string(),
        reason: error.to_string(),
    }
}

/// Schema 1: plaintext fields at the top level, no version marker.
#[derive(Debug, Deserialize)]
struct LegacyRemoteNoteV1 {
    local_id: LocalId,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    deleted: Option<bool>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    plain_text: Option<String>,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    labels: BTreeSet<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    attachments: Vec<RemoteAttachment>,
}

impl LegacyRemoteNoteV1 {
    fn migrate(self) -> RemoteNoteDocument {
        let plain_text = self.plain_text.unwrap_or_else(|| self.content.clone());
        RemoteNoteDocument {
            schema_version: REMOTE_SCHEMA_VERSION,
            local_id: self.local_id,
            updated_at: self.updated_at,
            deleted: self.deleted,
            payload: Some(NotePayload {
                title: self.title,
                content: self.content,
                plain_text,
                flags: NoteFlags {
                    pinned: self.pinned,
                    archived: self.archived,
                },
                labels: self.labels,
                color: self.color,
                reminder_at: None,
            }),
            encrypted_payload: None,
            attachments: self.attachments,
        }
    }
}
