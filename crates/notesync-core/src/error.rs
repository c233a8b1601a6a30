//! Error types for notesync-core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using notesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in notesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Media/object storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote store could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// An operation exceeded its time budget
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// Remote blob object does not exist (anymore)
    #[error("Remote object not found: {0}")]
    ObjectNotFound(String),

    /// Local attachment file referenced by a note is gone
    #[error("Local file missing: {0}")]
    LocalFileMissing(String),

    /// Encryption subsystem cannot encrypt/decrypt yet
    #[error("Encryption is not ready")]
    EncryptionNotReady,

    /// Payload should be decryptable but is not
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Remote document payload is malformed
    #[error("Invalid remote document {doc_id}: {reason}")]
    InvalidDocument { doc_id: String, reason: String },

    /// Sync cache file could not be parsed or written
    #[error("Sync cache error: {0}")]
    Cache(String),
}

impl Error {
    /// Failures resolved by dropping the affected sub-item only.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::LocalFileMissing(_))
    }

    /// Failures that are retried as a whole unit later.
    pub const fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout { .. }
                | Self::Storage(_)
                | Self::Io(_)
                | Self::Decryption(_)
                | Self::EncryptionNotReady
        )
    }

    /// Failures that clear up on their own once encryption becomes ready.
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::EncryptionNotReady)
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}
