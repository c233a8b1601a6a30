//! Attachment transfers between local files and the blob store.
//!
//! Transfers are idempotent: every finished upload or download is recorded as
//! a [`FileSyncTrack`] and later calls reuse the mapping once it has been
//! verified. Failures are split in two classes:
//!
//! - permanent (`ObjectNotFound`, `LocalFileMissing`): the attachment is
//!   dropped and the rest of the note proceeds
//! - everything else: the whole note is retried later

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    object_key_of, remote_reference, Attachment, FileSyncTrack, RemoteAttachment,
};
use crate::ports::{EncryptionProvider, FileSystem, FileTrackStore, RemoteBlobStore};
use crate::storage::{build_attachment_key, sanitize_file_name, sanitize_token};
use crate::util::{unix_millis_now, with_timeout};

const ATTACHMENTS_DIR: &str = "attachments";

/// Transferred attachments of one note plus the ones that were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome<T> {
    /// Successful transfers, in the note's attachment order
    pub items: Vec<T>,
    /// Paths of attachments dropped because of a permanent failure
    pub dropped: Vec<String>,
}

/// Uploads and downloads note attachments.
#[derive(Clone)]
pub struct AttachmentTransferManager {
    blobs: Arc<dyn RemoteBlobStore>,
    fs: Arc<dyn FileSystem>,
    tracks: Arc<dyn FileTrackStore>,
    encryption: Arc<dyn EncryptionProvider>,
    transfer_timeout: Duration,
    metadata_timeout: Duration,
    fan_out: usize,
}

impl AttachmentTransferManager {
    pub fn new(
        blobs: Arc<dyn RemoteBlobStore>,
        fs: Arc<dyn FileSystem>,
        tracks: Arc<dyn FileTrackStore>,
        encryption: Arc<dyn EncryptionProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            blobs,
            fs,
            tracks,
            encryption,
            transfer_timeout: config.upload_timeout(),
            metadata_timeout: config.metadata_timeout(),
            fan_out: config.attachment_fan_out.max(1),
        }
    }

    /// Override the configured timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, transfer: Duration, metadata: Duration) -> Self {
        self.transfer_timeout = transfer;
        self.metadata_timeout = metadata;
        self
    }

    /// Directory downloaded attachments are written to.
    pub fn attachments_dir(&self) -> PathBuf {
        self.fs.documents_dir().join(ATTACHMENTS_DIR)
    }

    /// Upload a local attachment unless a verified upload already exists.
    ///
    /// `owner` namespaces the object key, `doc_id` is the remote document of
    /// the owning note.
    pub async fn upload_if_needed(
        &self,
        attachment: &Attachment,
        owner: &str,
        doc_id: &str,
    ) -> Result<RemoteAttachment> {
        if attachment.is_remote() {
            return Ok(to_remote(attachment, attachment.path.clone()));
        }

        if let Some(track) = self.tracks.get_by_local_path(&attachment.path).await? {
            let key = track.remote_key;
            let exists = with_timeout(
                &format!("check {key}"),
                self.metadata_timeout,
                self.blobs.exists(&key),
            )
            .await?;
            if exists {
                return Ok(to_remote(attachment, remote_reference(&key)));
            }
            warn!(
                "Remote object {key} for {} is gone, uploading again",
                attachment.path
            );
            self.tracks.delete_track(&attachment.path).await?;
        }

        let path = Path::new(&attachment.path);
        if !self.fs.exists(path).await? {
            return Err(Error::LocalFileMissing(attachment.path.clone()));
        }

        let mut bytes = self.fs.read(path).await?;
        if self.encryption.is_ready() {
            bytes = self.encryption.encrypt(&bytes).await?;
        }

        let key = build_attachment_key(owner, attachment.file_name())?;
        with_timeout(
            &format!("upload {key}"),
            self.transfer_timeout,
            self.blobs.put(&key, bytes),
        )
        .await?;

        self.tracks
            .save_track(&FileSyncTrack {
                local_path: attachment.path.clone(),
                remote_key: key.clone(),
                doc_id: doc_id.to_string(),
                synced_at: unix_millis_now(),
            })
            .await?;

        debug!("Uploaded attachment {key}");
        Ok(to_remote(attachment, remote_reference(&key)))
    }

    /// Fetch a remote attachment unless a usable local copy exists.
    ///
    /// A local copy that still carries ciphertext framing was written before
    /// encryption was ready and is replaced.
    pub async fn download_if_needed(
        &self,
        remote: &RemoteAttachment,
        doc_id: &str,
    ) -> Result<Attachment> {
        let Some(key) = object_key_of(&remote.path) else {
            return Err(Error::ObjectNotFound(remote.path.clone()));
        };

        if let Some(track) = self.tracks.get_by_remote_path(key).await? {
            let local = Path::new(&track.local_path);
            if self.fs.exists(local).await? {
                let bytes = self.fs.read(local).await?;
                if !self.encryption.looks_encrypted(&bytes) {
                    return Ok(to_local(remote, track.local_path));
                }
                warn!(
                    "Local copy {} is still encrypted, downloading again",
                    track.local_path
                );
                self.fs.delete(local).await?;
            }
            self.tracks.delete_track(&track.local_path).await?;
        }

        let bytes = with_timeout(
            &format!("download {key}"),
            self.transfer_timeout,
            self.blobs.get(key),
        )
        .await?;
        let bytes = if self.encryption.looks_encrypted(&bytes) {
            self.encryption.decrypt(&bytes).await?
        } else {
            bytes
        };

        let local = self.local_path_for(doc_id, key);
        self.fs.write(&local, &bytes).await?;
        let local_path = local.to_string_lossy().into_owned();

        self.tracks
            .save_track(&FileSyncTrack {
                local_path: local_path.clone(),
                remote_key: key.to_string(),
                doc_id: doc_id.to_string(),
                synced_at: unix_millis_now(),
            })
            .await?;

        debug!("Downloaded attachment {key}");
        Ok(to_local(remote, local_path))
    }

    /// Upload every attachment of a note.
    ///
    /// Fails as a whole on the first non-permanent failure.
    pub async fn upload_all(
        &self,
        attachments: &[Attachment],
        owner: &str,
        doc_id: &str,
    ) -> Result<TransferOutcome<RemoteAttachment>> {
        let owner: Arc<str> = Arc::from(owner);
        let doc_id: Arc<str> = Arc::from(doc_id);
        self.transfer_all(attachments.to_vec(), move |manager, attachment: Attachment| {
            let owner = Arc::clone(&owner);
            let doc_id = Arc::clone(&doc_id);
            async move {
                let result = manager
                    .upload_if_needed(&attachment, &owner, &doc_id)
                    .await;
                (attachment.path, result)
            }
        })
        .await
    }

    /// Download every attachment of a remote document.
    ///
    /// Fails as a whole on the first non-permanent failure.
    pub async fn download_all(
        &self,
        attachments: &[RemoteAttachment],
        doc_id: &str,
    ) -> Result<TransferOutcome<Attachment>> {
        let doc_id: Arc<str> = Arc::from(doc_id);
        self.transfer_all(attachments.to_vec(), move |manager, remote: RemoteAttachment| {
            let doc_id = Arc::clone(&doc_id);
            async move {
                let result = manager.download_if_needed(&remote, &doc_id).await;
                (remote.path, result)
            }
        })
        .await
    }

    /// Delete managed local files that `current` no longer references.
    ///
    /// Remote objects are never touched. Returns the number of deleted files.
    pub async fn cleanup_orphans(
        &self,
        previous: &[Attachment],
        current: &[Attachment],
    ) -> Result<usize> {
        let keep: HashSet<&str> = current
            .iter()
            .map(|attachment| attachment.path.as_str())
            .collect();
        let managed = self.attachments_dir();

        let mut removed = 0;
        for attachment in previous {
            let path = Path::new(&attachment.path);
            if attachment.is_remote()
                || keep.contains(attachment.path.as_str())
                || !path.starts_with(&managed)
            {
                continue;
            }
            self.fs.delete(path).await?;
            self.tracks.delete_track(&attachment.path).await?;
            removed += 1;
        }

        if removed > 0 {
            info!("Removed {removed} orphaned attachment files");
        }
        Ok(removed)
    }

    async fn transfer_all<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        transfer: F,
    ) -> Result<TransferOutcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Self, I) -> Fut,
        Fut: Future<Output = (String, Result<T>)> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.fan_out));
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<T>> = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            slots.push(None);
            let permits = Arc::clone(&permits);
            let transfer = transfer(self.clone(), item);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, transfer.await)
            });
        }

        let mut dropped = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, (label, result)) = joined
                .map_err(|error| Error::Storage(format!("attachment transfer task failed: {error}")))?;
            match result {
                Ok(item) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(item);
                    }
                }
                Err(error) if error.is_permanent() => {
                    warn!("Dropping attachment {label}: {error}");
                    dropped.push(label);
                }
                // remaining transfers are aborted when `tasks` is dropped
                Err(error) => return Err(error),
            }
        }

        Ok(TransferOutcome {
            items: slots.into_iter().flatten().collect(),
            dropped,
        })
    }

    fn local_path_for(&self, doc_id: &str, key: &str) -> PathBuf {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        self.attachments_dir()
            .join(sanitize_token(doc_id))
            .join(sanitize_file_name(file_name))
    }
}

fn to_remote(attachment: &Attachment, path: String) -> RemoteAttachment {
    RemoteAttachment {
        kind: attachment.kind,
        path,
        metadata: attachment.metadata.clone(),
    }
}

fn to_local(remote: &RemoteAttachment, path: String) -> Attachment {
    Attachment {
        kind: remote.kind,
        path,
        metadata: remote.metadata.clone(),
    }
}
