//! Attachment model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Scheme prefix that marks an attachment path as a remote blob reference.
pub const REMOTE_REF_SCHEME: &str = "blob://";

/// Kind of binary payload attached to a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Sketch,
    File,
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Sketch => "sketch",
            Self::File => "file",
        };
        f.write_str(name)
    }
}

impl FromStr for AttachmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "sketch" => Ok(Self::Sketch),
            "file" => Ok(Self::File),
            other => Err(Error::InvalidInput(format!(
                "Unknown attachment kind: {other}"
            ))),
        }
    }
}

/// Attachment descriptor as stored on a local note.
///
/// `path` is either a local file path or a `blob://` remote reference that
/// has not been downloaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Attachment {
    #[must_use]
    pub fn new(kind: AttachmentKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Whether the path points at a remote blob rather than a local file.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        is_remote_reference(&self.path)
    }

    /// File name component of the path.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("file")
    }
}

/// Attachment descriptor as stored on a remote document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Uploaded object reference (`blob://...`)
    pub path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Check whether a path is a remote blob reference.
pub fn is_remote_reference(path: &str) -> bool {
    path.starts_with(REMOTE_REF_SCHEME)
}

/// Build a remote reference for an object key.
pub fn remote_reference(object_key: &str) -> String {
    format!("{REMOTE_REF_SCHEME}{}", object_key.trim_matches('/'))
}

/// Extract the object key from a remote reference.
pub fn object_key_of(reference: &str) -> Option<&str> {
    reference
        .strip_prefix(REMOTE_REF_SCHEME)
        .filter(|key| !key.is_empty())
}
