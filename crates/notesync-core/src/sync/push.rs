//! Push pass: pending local changes become remote document writes.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{
    LocalId, Note, PendingLocalChange, RemoteNoteDocument, SyncAction, SyncTrackStatus,
};
use crate::ports::{DocumentWrite, Session};
use crate::state::{SyncPhase, SyncReport};
use crate::util::{compact_text, millis_to_datetime, with_timeout};

use super::codec::encode_note;
use super::coordinator::{Claim, Inner};
use super::pull::Applied;
use super::resolver::{conflict_for, Resolution};

/// A document write waiting for the next batch commit.
struct StagedWrite<'a> {
    local_id: LocalId,
    /// Ledger stamp the write covers
    synced_through: i64,
    write: DocumentWrite,
    _claim: Claim<'a>,
}

impl Inner {
    pub(super) async fn push(self: &Arc<Self>, session: &Session, report: &mut SyncReport) {
        let changes = match self.deps.ledger.list_changes(true).await {
            Ok(changes) => changes,
            Err(error) => {
                warn!("Could not read pending changes: {error}");
                return;
            }
        };
        if changes.is_empty() {
            return;
        }

        self.set_phase(SyncPhase::Pushing, "Syncing notes…", changes.len());
        let mut batch = Vec::new();
        let mut newer_edits = false;

        for change in changes {
            let Some(claim) = self.claim_note(change.local_id) else {
                debug!("Note {} is already being synced", change.local_id);
                continue;
            };

            match self.stage(&change, session, report).await {
                Ok(Some(write)) => {
                    batch.push(StagedWrite {
                        local_id: change.local_id,
                        synced_through: change.updated_at,
                        write,
                        _claim: claim,
                    });
                    if batch.len() >= self.config.batch_write_limit {
                        newer_edits |= self.flush(&mut batch, report).await;
                    }
                }
                Ok(None) => {
                    self.note_succeeded(change.local_id);
                    self.advance_progress();
                }
                Err(error) => {
                    let status = if error.is_temporary() {
                        SyncTrackStatus::Pending
                    } else {
                        SyncTrackStatus::Failed
                    };
                    let message = compact_text(&error.to_string());
                    if let Err(error) = self
                        .deps
                        .ledger
                        .update_status(change.local_id, status, Some(&message))
                        .await
                    {
                        warn!("Could not record push failure: {error}");
                    }
                    self.note_failed(report, change.local_id, message);
                    self.advance_progress();
                }
            }
        }

        newer_edits |= self.flush(&mut batch, report).await;
        if newer_edits {
            debug!("Local edits arrived during push, scheduling another one");
            self.schedule_debounced_sync();
        }
    }

    /// Prepare the remote write for one change. `None` means the change was
    /// settled without writing anything.
    async fn stage(
        &self,
        change: &PendingLocalChange,
        session: &Session,
        report: &mut SyncReport,
    ) -> Result<Option<DocumentWrite>> {
        match change.action {
            SyncAction::Delete => self.stage_delete(change).await,
            SyncAction::Upload => self.stage_upload(change, session, report).await,
        }
    }

    async fn stage_delete(&self, change: &PendingLocalChange) -> Result<Option<DocumentWrite>> {
        let Some(remote_id) = change.remote_id.clone() else {
            debug!("Note {} was deleted before it was ever pushed", change.local_id);
            self.deps.ledger.delete_change(change.local_id).await?;
            return Ok(None);
        };

        self.deps
            .ledger
            .update_status(change.local_id, SyncTrackStatus::InProgress, None)
            .await?;
        let tombstone =
            RemoteNoteDocument::tombstone(change.local_id, millis_to_datetime(change.updated_at));
        Ok(Some(DocumentWrite {
            doc_id: remote_id,
            data: tombstone.to_value()?,
        }))
    }

    async fn stage_upload(
        &self,
        change: &PendingLocalChange,
        session: &Session,
        report: &mut SyncReport,
    ) -> Result<Option<DocumentWrite>> {
        let Some(note) = self.deps.notes.get_note(change.local_id).await? else {
            debug!("Note {} no longer exists, dropping its upload", change.local_id);
            self.deps.ledger.delete_change(change.local_id).await?;
            return Ok(None);
        };

        let remote_id = match note.remote_id.clone().or_else(|| change.remote_id.clone()) {
            Some(remote_id) => {
                if self
                    .reconcile_before_push(&note, change, &remote_id, report)
                    .await?
                {
                    return Ok(None);
                }
                remote_id
            }
            None => self.deps.documents.new_document_id(),
        };

        // persisted before the commit so a retry reuses the same document
        if change.remote_id.as_deref() != Some(remote_id.as_str()) {
            self.deps.ledger.assign_remote_id(note.id, &remote_id).await?;
        }
        if note.remote_id.as_deref() != Some(remote_id.as_str()) {
            self.deps.notes.set_remote_id(note.id, &remote_id).await?;
        }
        self.deps
            .ledger
            .update_status(note.id, SyncTrackStatus::InProgress, None)
            .await?;

        let uploaded = self
            .transfers
            .upload_all(&note.attachments, &session.user_id, &remote_id)
            .await?;
        if !uploaded.dropped.is_empty() {
            let kept: Vec<_> = note
                .attachments
                .iter()
                .filter(|attachment| !uploaded.dropped.contains(&attachment.path))
                .cloned()
                .collect();
            self.deps.notes.set_attachments(note.id, &kept).await?;
        }

        let doc = encode_note(self.deps.encryption.as_ref(), &note, uploaded.items).await?;
        Ok(Some(DocumentWrite {
            doc_id: remote_id,
            data: doc.to_value()?,
        }))
    }

    /// Look at the remote counterpart before overwriting it. Returns `true`
    /// when the change was settled by applying the remote side instead.
    async fn reconcile_before_push(
        &self,
        note: &Note,
        change: &PendingLocalChange,
        remote_id: &str,
        report: &mut SyncReport,
    ) -> Result<bool> {
        let fetched = with_timeout(
            &format!("fetch {remote_id}"),
            self.config.metadata_timeout(),
            self.deps.documents.get(remote_id),
        )
        .await?;
        let Some(fetched) = fetched else {
            return Ok(false);
        };
        let remote = match RemoteNoteDocument::from_value(remote_id, fetched.data) {
            Ok(remote) => remote,
            Err(error) => {
                warn!("Overwriting unreadable remote document: {error}");
                return Ok(false);
            }
        };

        if remote.is_tombstone() {
            info!("Note {} was deleted on another device", note.id);
            if let Some(conflict) = conflict_for(Resolution::DeleteLocal, note, remote_id, &remote) {
                self.deps.notes.record_conflict(&conflict).await?;
            }
            self.delete_local(note).await?;
            report.deleted += 1;
            return Ok(true);
        }

        let remote_is_newer = remote.updated_at_millis() > change.updated_at;
        if !remote_is_newer || change.status == SyncTrackStatus::Pending {
            return Ok(false);
        }

        debug!("Remote copy of note {} is newer than the retried edit", note.id);
        let Some(_claim) = self.claim_doc(remote_id) else {
            // the live feed is applying this document right now
            return Ok(true);
        };
        let outcome = self
            .apply_remote(remote_id, &remote, Some(note.clone()), Some(change.updated_at))
            .await?;
        if let Applied::Applied(_) = outcome {
            self.deps
                .ledger
                .complete_change(note.id, change.updated_at)
                .await?;
            report.applied += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commit the batch. Returns `true` when a note was edited again while
    /// the commit was in flight.
    async fn flush(
        &self,
        batch: &mut Vec<StagedWrite<'_>>,
        report: &mut SyncReport,
    ) -> bool {
        if batch.is_empty() {
            return false;
        }
        let staged = std::mem::take(batch);
        let writes = staged.iter().map(|entry| entry.write.clone()).collect();

        let committed = with_timeout(
            "commit note batch",
            self.config.metadata_timeout(),
            self.deps.documents.commit(writes),
        )
        .await;

        let mut newer_edits = false;
        match committed {
            Ok(()) => {
                for entry in &staged {
                    match self
                        .deps
                        .ledger
                        .complete_change(entry.local_id, entry.synced_through)
                        .await
                    {
                        Ok(true) => {
                            report.pushed += 1;
                            self.note_succeeded(entry.local_id);
                        }
                        Ok(false) => {
                            newer_edits = true;
                            if let Err(error) = self
                                .deps
                                .ledger
                                .update_status(entry.local_id, SyncTrackStatus::Pending, None)
                                .await
                            {
                                warn!("Could not reset note {} to pending: {error}", entry.local_id);
                            }
                        }
                        Err(error) => {
                            self.note_failed(report, entry.local_id, error.to_string());
                        }
                    }
                    self.advance_progress();
                }
                debug!("Committed {} note writes", staged.len());
            }
            Err(error) => {
                let message = compact_text(&error.to_string());
                for entry in &staged {
                    if let Err(error) = self
                        .deps
                        .ledger
                        .update_status(entry.local_id, SyncTrackStatus::Failed, Some(&message))
                        .await
                    {
                        warn!("Could not record push failure: {error}");
                    }
                    self.note_failed(report, entry.local_id, message.clone());
                    self.advance_progress();
                }
            }
        }
        newer_edits
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::models::{Attachment, AttachmentKind, STRATEGY_REMOTE_TOMBSTONE};
    use crate::ports::ChangeLedger;
    use crate::testing::{test_config, MemoryBlobStore, MemoryDocumentStore, TestDevice};
    use crate::util::millis_to_datetime;
    use crate::SyncConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn device() -> TestDevice {
        TestDevice::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_push_never_creates_a_second_document() {
        let device = device().await;
        let note = device.create("Once", "only one remote copy").await;
        device.documents.fail_next_commits(1);

        let failed = device.coordinator.refresh().await;
        assert!(failed.failed.contains(&note.id));
        let change = device.db.get_change(note.id).await.unwrap().unwrap();
        let assigned = change.remote_id.clone().unwrap();
        assert_eq!(change.status, SyncTrackStatus::Failed);
        assert_eq!(change.retry_count, 1);
        assert_eq!(device.documents.len(), 0);

        let retried = device.coordinator.refresh().await;
        assert_eq!(retried.pushed, 1);
        assert_eq!(device.documents.len(), 1);
        assert!(device.documents.document(&assigned).is_some());
        assert!(device.db.get_change(note.id).await.unwrap().is_none());
        assert_eq!(
            device.db.get_note(note.id).await.unwrap().unwrap().remote_id,
            Some(assigned)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edit_during_commit_stays_pending() {
        let config = SyncConfig {
            debounce_ms: 60_000,
            ..test_config()
        };
        let device = TestDevice::with_config(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
            config,
        )
        .await;
        let note = device.create("Draft", "v1").await;
        let (arrived, release) = device.documents.hold_commits();

        let coordinator = device.coordinator.clone();
        let pushing = tokio::spawn(async move { coordinator.refresh().await });
        arrived.notified().await;
        let mut edited = device.db.get_note(note.id).await.unwrap().unwrap();
        edited.content = "v2".to_string();
        device.db.update_note(&edited).await.unwrap();
        release.notify_one();
        let report = pushing.await.unwrap();

        assert_eq!(report.pushed, 0);
        assert_eq!(device.documents.len(), 1);
        let change = device.db.get_change(note.id).await.unwrap().unwrap();
        assert_eq!(change.status, SyncTrackStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_tombstone_deletes_instead_of_pushing() {
        let device = device().await;
        let note = device.create("Shared", "v1").await;
        device.coordinator.refresh().await;
        let remote_id = device.db.get_note(note.id).await.unwrap().unwrap().remote_id.unwrap();

        device.documents.put_document(
            &remote_id,
            &RemoteNoteDocument::tombstone(77, millis_to_datetime(note.updated_at)),
        );
        let mut edited = device.db.get_note(note.id).await.unwrap().unwrap();
        edited.content = "edited after the remote delete".to_string();
        device.db.update_note(&edited).await.unwrap();

        let report = device.coordinator.refresh().await;

        assert_eq!(report.deleted, 1);
        assert_eq!(report.pushed, 0);
        assert!(device.db.get_note(note.id).await.unwrap().is_none());
        assert!(device.db.get_change(note.id).await.unwrap().is_none());
        assert!(device.documents.document(&remote_id).unwrap().is_tombstone());
        let conflicts = device.db.list_conflicts(10).await.unwrap();
        assert_eq!(conflicts[0].strategy, STRATEGY_REMOTE_TOMBSTONE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_a_pushed_note_writes_a_tombstone() {
        let device = device().await;
        let note = device.create("Old", "remove me").await;
        device.coordinator.refresh().await;
        let remote_id = device.db.get_note(note.id).await.unwrap().unwrap().remote_id.unwrap();

        device.db.delete_note(note.id).await.unwrap();
        let report = device.coordinator.refresh().await;

        assert_eq!(report.pushed, 1);
        let remote = device.documents.document(&remote_id).unwrap();
        assert!(remote.is_tombstone());
        assert_eq!(remote.payload, None);
        assert!(device.db.get_change(note.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_pushed_delete_is_dropped_locally() {
        let device = device().await;
        let note = device.create("Scratch", "tmp").await;
        device.db.delete_note(note.id).await.unwrap();

        let report = device.coordinator.refresh().await;

        assert_eq!(report.pushed, 0);
        assert_eq!(device.documents.len(), 0);
        assert!(device.db.list_changes(false).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_attachment_is_dropped_and_note_still_syncs() {
        let device = device().await;
        let dir = device.documents_dir().join("picked");
        std::fs::create_dir_all(&dir).unwrap();
        let mut note = Note::new("Photos", "three pictures");
        for name in ["a.png", "b.png", "c.png"] {
            let path = dir.join(name);
            if name != "b.png" {
                std::fs::write(&path, name.as_bytes()).unwrap();
            }
            note.attachments
                .push(Attachment::new(AttachmentKind::Image, path.to_string_lossy()));
        }
        let note = device.db.create_note(&note).await.unwrap();

        let report = device.coordinator.refresh().await;

        assert_eq!(report.pushed, 1);
        let local = device.db.get_note(note.id).await.unwrap().unwrap();
        assert_eq!(local.attachments.len(), 2);
        let remote = device
            .documents
            .document(local.remote_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(remote.attachments.len(), 2);
        assert!(remote.attachments.iter().all(|a| a.path.starts_with("blob://")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attachment_timeout_leaves_whole_note_pending() {
        let config = SyncConfig {
            upload_timeout_secs: 1,
            ..test_config()
        };
        let device = TestDevice::with_config(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
            config,
        )
        .await;
        let path = device.documents_dir().join("slow.png");
        std::fs::write(&path, b"slow").unwrap();
        let mut note = Note::new("Slow", "upload stalls");
        note.attachments
            .push(Attachment::new(AttachmentKind::Image, path.to_string_lossy()));
        let note = device.db.create_note(&note).await.unwrap();
        device.blobs.stall_puts(true);

        let report = device.coordinator.refresh().await;

        assert!(report.failed.contains(&note.id));
        assert_eq!(device.documents.len(), 0);
        let change = device.db.get_change(note.id).await.unwrap().unwrap();
        assert_eq!(change.status, SyncTrackStatus::Pending);
        assert!(change.last_error.unwrap().contains("timed out"));
        assert!(device.coordinator.status().failed.contains(&note.id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_wins_over_a_retried_edit() {
        let device = device().await;
        let note = device.create("Mine", "old").await;
        device.coordinator.refresh().await;
        let remote_id = device.db.get_note(note.id).await.unwrap().unwrap().remote_id.unwrap();

        let mut change = PendingLocalChange::new(note.id, SyncAction::Upload, note.updated_at);
        change.remote_id = Some(remote_id.clone());
        change.status = SyncTrackStatus::Failed;
        device.db.save_change(&change).await.unwrap();

        let mut newer = device.documents.document(&remote_id).unwrap();
        newer.updated_at = millis_to_datetime(note.updated_at + 10_000);
        newer.encrypted_payload = None;
        newer.payload = Some(crate::models::NotePayload {
            title: "Theirs".to_string(),
            content: "new".to_string(),
            ..Default::default()
        });
        device.documents.put_document(&remote_id, &newer);

        let report = device.coordinator.refresh().await;

        assert_eq!(report.pushed, 0);
        let local = device.db.get_note(note.id).await.unwrap().unwrap();
        assert_eq!(local.title, "Theirs");
        assert_eq!(local.updated_at, note.updated_at + 10_000);
        assert!(device.db.get_change(note.id).await.unwrap().is_none());
        assert_eq!(device.documents.document(&remote_id).unwrap().updated_at, newer.updated_at);
    }
}
