//! Pull pass: fetch remote changes into the persistent cache, then drain the
//! cache into the local store.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{LocalId, Note, PendingLocalChange, RemoteNoteDocument};
use crate::ports::{DocumentCursor, RemoteDocument};
use crate::state::{SyncEvent, SyncPhase, SyncReport};
use crate::util::with_timeout;

use super::cache::PendingRemoteSync;
use super::codec::{apply_payload, decode_payload};
use super::coordinator::Inner;
use super::resolver::{conflict_for, resolve, skip_on_initial_sync, Resolution};

/// What happened to one remote document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Applied {
    Applied(LocalId),
    /// The local version stays
    Kept,
    Deleted,
    /// Undecryptable for now
    Deferred,
    /// Another task is working on the document
    Busy,
}

impl Inner {
    pub(super) async fn pull(&self, report: &mut SyncReport) {
        self.set_phase(SyncPhase::Fetching, "Fetching…", 0);
        // cached entries of an unvalidated stale session must not be applied
        if let Err(error) = self.prepare_session().await {
            warn!("Could not prepare sync session, not applying cached changes: {error}");
            return;
        }
        if let Err(error) = self.fetch_pages().await {
            warn!("Fetching remote changes failed: {error}");
        }
        if let Err(error) = self.drain(report).await {
            warn!("Applying remote changes failed: {error}");
        }
    }

    /// Start a new session, or make an interrupted one safe to resume.
    async fn prepare_session(&self) -> Result<()> {
        if !self.cache.is_resumable().await? {
            let watermark = self.cache.watermark().await?;
            self.cache.start_new_sync(watermark).await?;
        } else if self
            .cache
            .is_cache_stale(self.config.stale_cache_threshold())
            .await?
        {
            self.revalidate_cache().await?;
        } else {
            debug!("Resuming interrupted sync session");
        }
        Ok(())
    }

    async fn fetch_pages(&self) -> Result<()> {
        let watermark = self.cache.watermark().await?;
        loop {
            let query = self.cache.next_query(self.config.page_size).await?;
            let documents = with_timeout(
                "fetch remote changes",
                self.config.metadata_timeout(),
                self.deps.documents.query_changes(&query),
            )
            .await?;
            if documents.is_empty() {
                self.cache.mark_all_fetched().await?;
                break;
            }

            let has_more = documents.len() >= self.config.page_size;
            let last_document_id = documents.last().map(|document| document.id.clone());
            let cursor = documents.iter().rev().find_map(cursor_of);
            if cursor.is_none() {
                return Err(Error::InvalidDocument {
                    doc_id: last_document_id.unwrap_or_default(),
                    reason: "page carries no readable updated_at".to_string(),
                });
            }

            let entries: Vec<_> = documents
                .into_iter()
                .filter_map(|document| {
                    match RemoteNoteDocument::from_value(&document.id, document.data) {
                        Ok(doc) if skip_on_initial_sync(watermark, &doc) => None,
                        Ok(doc) => Some(PendingRemoteSync::new(document.id, doc)),
                        Err(error) => {
                            warn!("Skipping unreadable remote document: {error}");
                            None
                        }
                    }
                })
                .collect();

            let page = self
                .cache
                .add_page(entries, last_document_id, cursor, has_more)
                .await?;
            debug!("Fetched page {page}");
            if !has_more {
                break;
            }
        }
        Ok(())
    }

    /// Replace cached entries of an old session with the server's current
    /// documents before applying them.
    async fn revalidate_cache(&self) -> Result<()> {
        let pending = self.cache.get_pending_syncs().await?;
        info!("Revalidating {} cached remote changes", pending.len());

        for entry in pending {
            let doc_id = entry.remote_doc_id.as_str();
            let fetched = with_timeout(
                &format!("fetch {doc_id}"),
                self.config.metadata_timeout(),
                self.deps.documents.get(doc_id),
            )
            .await?;
            let fresh = match fetched {
                Some(document) => match RemoteNoteDocument::from_value(doc_id, document.data) {
                    Ok(doc) => Some(doc),
                    Err(error) => {
                        warn!("Keeping cached copy of unreadable document: {error}");
                        continue;
                    }
                },
                None => None,
            };
            self.cache.refresh_entry(doc_id, fresh).await?;
        }
        self.cache.touch().await
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        let pending = self.cache.get_pending_syncs().await?;
        if pending.is_empty() {
            return Ok(());
        }
        self.set_phase(SyncPhase::Draining, "Syncing notes…", pending.len());

        for entry in pending {
            let doc_id = entry.remote_doc_id.as_str();
            self.cache.mark_in_progress(doc_id).await?;

            match self.reconcile(doc_id, &entry.remote_data).await {
                Ok(Applied::Deferred) => {
                    report.deferred += 1;
                    self.cache.mark_deferred(doc_id).await?;
                }
                Ok(Applied::Busy) => self.cache.release(doc_id).await?,
                Ok(outcome) => {
                    self.record_outcome(outcome, report);
                    self.cache
                        .mark_applied(doc_id, entry.remote_data.updated_at)
                        .await?;
                }
                Err(error) if error.is_deferred() => {
                    report.deferred += 1;
                    self.cache.mark_deferred(doc_id).await?;
                }
                Err(error) => {
                    self.cache.mark_failed(doc_id, &error.to_string()).await?;
                    self.report_remote_failure(doc_id, &error, report).await;
                }
            }
            self.advance_progress();
        }

        let metadata = self.cache.metadata().await?;
        if metadata.sync_complete {
            info!("Sync session complete");
        }
        Ok(())
    }

    /// Decide and apply one remote document against local state.
    pub(super) async fn reconcile(
        &self,
        doc_id: &str,
        remote: &RemoteNoteDocument,
    ) -> Result<Applied> {
        let Some(_claim) = self.claim_doc(doc_id) else {
            return Ok(Applied::Busy);
        };

        let local = self.deps.notes.find_by_remote_id(doc_id).await?;
        let pending = self.pending_change_for(doc_id, local.as_ref()).await?;
        let resolution = resolve(
            local.as_ref(),
            pending.as_ref(),
            remote,
            self.deps.encryption.is_ready(),
        );

        if let Some(conflict) = local
            .as_ref()
            .and_then(|local| conflict_for(resolution, local, doc_id, remote))
        {
            info!(
                "Conflict on note {} resolved as {}",
                conflict.note_id, conflict.strategy
            );
            self.deps.notes.record_conflict(&conflict).await?;
        }

        match resolution {
            Resolution::DeferUndecryptable => Ok(Applied::Deferred),
            Resolution::KeepLocal => Ok(Applied::Kept),
            Resolution::DeleteLocal => match local {
                Some(local) => {
                    self.delete_local(&local).await?;
                    Ok(Applied::Deleted)
                }
                None => {
                    // a queued upload must not resurrect the note
                    if let Some(pending) = pending {
                        self.deps.ledger.delete_change(pending.local_id).await?;
                    }
                    Ok(Applied::Kept)
                }
            },
            Resolution::ApplyRemote => self.apply_remote(doc_id, remote, local, None).await,
        }
    }

    /// Write a remote version into the local store.
    ///
    /// `tolerated_edit` is the newest local edit (Unix ms) the remote version
    /// may overwrite; with `None` any unsynced edit keeps the local version.
    pub(super) async fn apply_remote(
        &self,
        doc_id: &str,
        remote: &RemoteNoteDocument,
        local: Option<Note>,
        tolerated_edit: Option<i64>,
    ) -> Result<Applied> {
        let payload = decode_payload(self.deps.encryption.as_ref(), doc_id, remote).await?;
        let downloaded = self
            .transfers
            .download_all(&remote.attachments, doc_id)
            .await?;

        // downloads take time; the user may have edited meanwhile
        if let Some(local) = &local {
            if self.local_edit_blocks(local.id, tolerated_edit).await? {
                debug!("Note {} was edited during download, keeping it", local.id);
                return Ok(Applied::Kept);
            }
        }

        let previous = local
            .as_ref()
            .map(|note| note.attachments.clone())
            .unwrap_or_default();
        let mut note = local.unwrap_or_else(|| Note::new("", ""));
        apply_payload(&mut note, doc_id, remote, payload, downloaded.items);

        let saved = self.deps.notes.save_note(&note).await?;
        if let Err(error) = self
            .transfers
            .cleanup_orphans(&previous, &saved.attachments)
            .await
        {
            warn!("Could not clean up replaced attachments: {error}");
        }
        self.emit(SyncEvent::NoteApplied(saved.id));
        Ok(Applied::Applied(saved.id))
    }

    /// Remove a note deleted on another device, with its ledger row and
    /// managed attachment files.
    pub(super) async fn delete_local(&self, note: &Note) -> Result<()> {
        self.deps.notes.delete_note(note.id).await?;
        self.deps.ledger.delete_change(note.id).await?;
        if let Err(error) = self.transfers.cleanup_orphans(&note.attachments, &[]).await {
            warn!("Could not remove attachments of deleted note {}: {error}", note.id);
        }
        self.emit(SyncEvent::NoteDeleted(note.id));
        Ok(())
    }

    pub(super) async fn pending_change_for(
        &self,
        doc_id: &str,
        local: Option<&Note>,
    ) -> Result<Option<PendingLocalChange>> {
        if let Some(local) = local {
            return self.deps.ledger.get_change(local.id).await;
        }
        let changes = self.deps.ledger.list_changes(true).await?;
        Ok(changes
            .into_iter()
            .find(|change| change.remote_id.as_deref() == Some(doc_id)))
    }

    async fn local_edit_blocks(&self, local_id: LocalId, tolerated_edit: Option<i64>) -> Result<bool> {
        let Some(change) = self.deps.ledger.get_change(local_id).await? else {
            return Ok(false);
        };
        if !change.status.is_unsynced() {
            return Ok(false);
        }
        Ok(tolerated_edit.map_or(true, |tolerated| change.updated_at > tolerated))
    }

    pub(super) fn record_outcome(&self, outcome: Applied, report: &mut SyncReport) {
        match outcome {
            Applied::Applied(local_id) => {
                report.applied += 1;
                self.note_succeeded(local_id);
            }
            Applied::Deleted => report.deleted += 1,
            Applied::Deferred => report.deferred += 1,
            Applied::Kept | Applied::Busy => {}
        }
    }

    pub(super) async fn report_remote_failure(
        &self,
        doc_id: &str,
        error: &Error,
        report: &mut SyncReport,
    ) {
        match self.deps.notes.find_by_remote_id(doc_id).await {
            Ok(Some(local)) => self.note_failed(report, local.id, error.to_string()),
            _ => warn!("Could not apply remote document {doc_id}: {error}"),
        }
    }
}

/// Position of a raw document, read before the document itself is parsed.
fn cursor_of(document: &RemoteDocument) -> Option<DocumentCursor> {
    let updated_at: DateTime<Utc> = document.data.get("updated_at")?.as_str()?.parse().ok()?;
    Some(DocumentCursor {
        updated_at,
        doc_id: document.id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use crate::config::SyncConfig;
    use crate::models::{
        remote_reference, AttachmentKind, NotePayload, RemoteAttachment, STRATEGY_KEEP_LOCAL,
    };
    use crate::ports::{ChangeLedger, NoteStore, RemoteDocumentStore};
    use crate::testing::{test_config, MemoryBlobStore, MemoryDocumentStore, TestDevice};
    use crate::util::{millis_to_datetime, unix_millis_now};

    use super::*;

    fn plain_doc(title: &str, updated_at: i64) -> RemoteNoteDocument {
        let mut doc = RemoteNoteDocument::tombstone(1, millis_to_datetime(updated_at));
        doc.deleted = Some(false);
        doc.payload = Some(NotePayload {
            title: title.to_string(),
            content: format!("{title} body"),
            ..NotePayload::default()
        });
        doc
    }

    async fn shared_devices() -> (TestDevice, TestDevice) {
        let documents = Arc::new(MemoryDocumentStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let first = TestDevice::new(documents.clone(), blobs.clone()).await;
        let second = TestDevice::new(documents, blobs).await;
        (first, second)
    }

    async fn only_note(device: &TestDevice) -> Note {
        let mut notes = device.db.list_notes(10, 0).await.unwrap();
        assert_eq!(notes.len(), 1);
        notes.remove(0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_devices_converge_on_the_latest_edit() {
        let (first, second) = shared_devices().await;
        first.create("Groceries", "milk").await;
        first.coordinator.refresh().await;
        second.coordinator.refresh().await;

        let mut on_first = only_note(&first).await;
        on_first.content = "milk, eggs".to_string();
        first.db.update_note(&on_first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut on_second = only_note(&second).await;
        on_second.content = "milk, bread".to_string();
        second.db.update_note(&on_second).await.unwrap();

        first.coordinator.refresh().await;
        second.coordinator.refresh().await;
        first.coordinator.refresh().await;

        let first_note = only_note(&first).await;
        let second_note = only_note(&second).await;
        assert_eq!(first_note.content, "milk, bread");
        assert_eq!(second_note.content, "milk, bread");
        assert_eq!(first_note.updated_at, second_note.updated_at);
        assert_eq!(first_note.remote_id, second_note.remote_id);
        assert_eq!(first.documents.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_sync_skips_tombstones() {
        let (first, second) = shared_devices().await;
        let now = unix_millis_now();
        first.documents.put_document("gone", &RemoteNoteDocument::tombstone(4, millis_to_datetime(now)));
        first.documents.put_document("kept", &plain_doc("Kept", now + 1));

        let report = second.coordinator.refresh().await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.deleted, 0);
        let note = only_note(&second).await;
        assert_eq!(note.title, "Kept");
        assert_eq!(note.remote_id.as_deref(), Some("kept"));
        let metadata = second.coordinator.cache_metadata().await.unwrap();
        assert!(metadata.sync_complete);
        assert_eq!(metadata.last_synced_at, Some(millis_to_datetime(now + 1)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn later_tombstone_deletes_synced_note() {
        let (first, second) = shared_devices().await;
        first.create("Shared", "body").await;
        first.coordinator.refresh().await;
        second.coordinator.refresh().await;
        let note = only_note(&first).await;

        second.db.delete_note(only_note(&second).await.id).await.unwrap();
        second.coordinator.refresh().await;
        let report = first.coordinator.refresh().await;

        assert_eq!(report.deleted, 1);
        assert!(first.db.get_note(note.id).await.unwrap().is_none());
        assert!(first.db.list_changes(false).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_local_edit_is_kept_and_conflict_recorded() {
        let (first, second) = shared_devices().await;
        first.create("Plan", "v1").await;
        first.coordinator.refresh().await;
        second.coordinator.refresh().await;

        // second edits later but first still has an unpushed edit
        first.entitlement.set_paid(false);
        let mut on_first = only_note(&first).await;
        on_first.content = "first".to_string();
        first.db.update_note(&on_first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut on_second = only_note(&second).await;
        on_second.content = "second".to_string();
        second.db.update_note(&on_second).await.unwrap();
        second.coordinator.refresh().await;

        let report = first.coordinator.refresh().await;

        assert_eq!(report.applied, 0);
        assert_eq!(only_note(&first).await.content, "first");
        let conflicts = first.db.list_conflicts(10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].strategy, STRATEGY_KEEP_LOCAL);
        assert!(first.db.get_change(on_first.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_session_resumes_without_refetching() {
        let documents = Arc::new(MemoryDocumentStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let mut device = TestDevice::new(documents.clone(), blobs.clone()).await;
        let base = unix_millis_now();
        for index in 0..5 {
            let key = format!("notes/user-1/doc{index}/pic.png");
            let mut doc = plain_doc(&format!("Note {index}"), base + index);
            doc.attachments.push(RemoteAttachment {
                kind: AttachmentKind::Image,
                path: remote_reference(&key),
                metadata: Default::default(),
            });
            documents.put_document(&format!("doc{index}"), &doc);
            blobs.insert(&key, b"png".to_vec());
        }
        blobs.fail_gets(true);

        let first = device.coordinator.refresh().await;
        assert_eq!(first.applied, 0);
        assert_eq!(documents.query_count(), 3);
        assert_eq!(device.db.list_notes(10, 0).await.unwrap().len(), 0);

        device.restart(test_config());
        blobs.fail_gets(false);
        let resumed = device.coordinator.refresh().await;

        assert_eq!(resumed.applied, 5);
        assert_eq!(documents.query_count(), 4);
        assert!(device.coordinator.cache_metadata().await.unwrap().sync_complete);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_session_is_revalidated_against_the_server() {
        let documents = Arc::new(MemoryDocumentStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let config = SyncConfig {
            stale_cache_secs: 0,
            ..test_config()
        };
        let mut device = TestDevice::with_config(documents.clone(), blobs.clone(), config.clone()).await;
        let now = unix_millis_now();
        let mut doc = plain_doc("Old title", now);
        doc.attachments.push(RemoteAttachment {
            kind: AttachmentKind::Image,
            path: remote_reference("notes/user-1/n/pic.png"),
            metadata: Default::default(),
        });
        documents.put_document("n", &doc);
        blobs.fail_gets(true);
        device.coordinator.refresh().await;

        documents.put_document("n", &plain_doc("New title", now + 1));
        device.restart(config);
        blobs.fail_gets(false);
        let report = device.coordinator.refresh().await;

        assert_eq!(report.applied, 1);
        let note = only_note(&device).await;
        assert_eq!(note.title, "New title");
        assert!(note.attachments.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_session_is_not_applied_when_revalidation_fails() {
        let documents = Arc::new(MemoryDocumentStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let config = SyncConfig {
            stale_cache_secs: 0,
            ..test_config()
        };
        let mut device = TestDevice::with_config(documents.clone(), blobs.clone(), config.clone()).await;
        let now = unix_millis_now();
        let mut doc = plain_doc("Old title", now);
        doc.attachments.push(RemoteAttachment {
            kind: AttachmentKind::Image,
            path: remote_reference("notes/user-1/n/pic.png"),
            metadata: Default::default(),
        });
        documents.put_document("n", &doc);
        blobs.insert("notes/user-1/n/pic.png", b"png".to_vec());
        blobs.fail_gets(true);
        device.coordinator.refresh().await;

        device.restart(config.clone());
        blobs.fail_gets(false);
        documents.fail_gets(true);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let report = device.coordinator.refresh().await;

        assert_eq!(report.applied, 0);
        assert!(device.db.list_notes(10, 0).await.unwrap().is_empty());
        assert!(device.coordinator.cache_metadata().await.unwrap().is_resumable());

        documents.put_document("n", &plain_doc("New title", now + 1));
        documents.fail_gets(false);
        device.restart(config);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let report = device.coordinator.refresh().await;

        assert_eq!(report.applied, 1);
        assert_eq!(only_note(&device).await.title, "New title");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_remote_attachment_does_not_block_the_note() {
        let device = TestDevice::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
        )
        .await;
        let mut doc = plain_doc("Trip", unix_millis_now());
        for name in ["a.png", "b.png", "c.png"] {
            let key = format!("notes/user-1/trip/{name}");
            doc.attachments.push(RemoteAttachment {
                kind: AttachmentKind::Image,
                path: remote_reference(&key),
                metadata: Default::default(),
            });
            if name != "b.png" {
                device.blobs.insert(&key, name.as_bytes().to_vec());
            }
        }
        device.documents.put_document("trip", &doc);

        let report = device.coordinator.refresh().await;

        assert_eq!(report.applied, 1);
        assert!(report.failed.is_empty());
        let note = only_note(&device).await;
        assert_eq!(note.title, "Trip");
        assert_eq!(note.attachments.len(), 2);
        for attachment in &note.attachments {
            assert!(std::path::Path::new(&attachment.path).exists());
        }
        let metadata = device.coordinator.cache_metadata().await.unwrap();
        assert!(metadata.sync_complete);
        assert!(metadata.outstanding_pages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encryption_becoming_ready_refetches_everything() {
        let (first, second) = shared_devices().await;
        first.create("Secret", "body").await;
        first.coordinator.refresh().await;
        second.coordinator.refresh().await;
        assert!(second.coordinator.cache_metadata().await.unwrap().last_synced_at.is_some());

        second.encryption.set_ready(false);
        second
            .coordinator
            .handle_trigger(crate::sync::SyncTrigger::EncryptionReadyChanged)
            .await;
        let mut events = second.coordinator.subscribe_events();
        second.encryption.set_ready(true);
        let queries = second.documents.query_count();
        second
            .coordinator
            .handle_trigger(crate::sync::SyncTrigger::EncryptionReadyChanged)
            .await;

        assert_eq!(events.recv().await.unwrap(), SyncEvent::Reset);
        assert!(second.documents.query_count() > queries);
        assert_eq!(only_note(&second).await.title, "Secret");
        assert!(second.coordinator.cache_metadata().await.unwrap().last_synced_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_documents_are_skipped() {
        let device = TestDevice::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
        )
        .await;
        let now = unix_millis_now();
        device.documents.put_document("good", &plain_doc("Good", now));
        device
            .documents
            .set_merge("bad", serde_json::json!({ "schema_version": 9, "updated_at": millis_to_datetime(now + 1) }))
            .await
            .unwrap();

        let report = device.coordinator.refresh().await;

        assert_eq!(report.applied, 1);
        assert_eq!(only_note(&device).await.title, "Good");
        assert!(device.db.find_by_remote_id("bad").await.unwrap().is_none());
    }
}
