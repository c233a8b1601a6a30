//! Live change feed: remote edits applied as they arrive.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::RemoteNoteDocument;
use crate::ports::{ChangeKind, RemoteChange};
use crate::state::SyncReport;

use super::cache::{PendingRemoteSync, RemoteSyncStatus};
use super::coordinator::{lock, Inner};
use super::pull::Applied;

impl Inner {
    /// Subscribe to remote changes newer than the watermark. Replaces a
    /// running subscription.
    pub(super) async fn start_realtime_listener(self: &Arc<Self>) -> Result<()> {
        let gates = self.gates();
        let Some(session) = gates.session.filter(|_| gates.can_receive) else {
            debug!("Not listening for remote changes, sync gates closed");
            return Ok(());
        };
        self.check_account(&session).await?;
        self.stop_realtime_listener();

        let after = self.cache.watermark().await?;
        let mut feed = self.deps.documents.subscribe(after).await?;
        let inner = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(batch) = feed.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_remote_batch(batch).await;
            }
            debug!("Change feed closed");
        });

        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
        info!("Listening for remote changes");
        Ok(())
    }

    pub(super) fn stop_realtime_listener(&self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
            debug!("Stopped listening for remote changes");
        }
    }

    pub(super) fn is_listening(&self) -> bool {
        lock(&self.listener)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Apply one feed batch. Entries that could not be applied are queued in
    /// the persistent cache for the next drain, so a later batch moving the
    /// watermark cannot skip them. The watermark moves only when every entry
    /// was applied; the return value says whether it was.
    pub(super) async fn handle_remote_batch(&self, batch: Vec<RemoteChange>) -> bool {
        if !self.gates().can_receive {
            return false;
        }

        let mut report = SyncReport::default();
        let mut seen = HashSet::new();
        let mut newest: Option<DateTime<Utc>> = None;
        let mut retry = Vec::new();

        for change in batch {
            if change.kind == ChangeKind::Removed || !seen.insert(change.document.id.clone()) {
                continue;
            }
            let doc_id = change.document.id;
            let remote = match RemoteNoteDocument::from_value(&doc_id, change.document.data) {
                Ok(remote) => remote,
                Err(error) => {
                    warn!("Ignoring unreadable live change: {error}");
                    continue;
                }
            };
            newest = newest.max(Some(remote.updated_at));

            match self.apply_live_change(&doc_id, &remote).await {
                Ok(Applied::Busy) => retry.push(PendingRemoteSync::new(doc_id, remote)),
                Ok(Applied::Deferred) => {
                    report.deferred += 1;
                    retry.push(deferred_entry(doc_id, remote));
                }
                Ok(outcome) => self.record_outcome(outcome, &mut report),
                Err(error) if error.is_deferred() => {
                    report.deferred += 1;
                    retry.push(deferred_entry(doc_id, remote));
                }
                Err(error) => {
                    self.report_remote_failure(&doc_id, &error, &mut report).await;
                    let mut entry = PendingRemoteSync::new(doc_id, remote);
                    entry.status = RemoteSyncStatus::Failed;
                    entry.retry_count = 1;
                    entry.last_error = Some(error.to_string());
                    retry.push(entry);
                }
            }
        }

        let all_applied = retry.is_empty();
        if let Err(error) = self.cache.enqueue(retry).await {
            warn!("Could not queue failed live changes: {error}");
            return false;
        }
        if let Some(at) = newest.filter(|_| all_applied) {
            if let Err(error) = self.cache.advance_watermark(at).await {
                warn!("Could not advance watermark: {error}");
            }
            self.publish(|status| {
                status.last_synced_at = status.last_synced_at.max(Some(at));
            });
        }
        debug!(
            "Live batch: {} applied, {} deleted, {} deferred",
            report.applied, report.deleted, report.deferred
        );
        all_applied
    }

    async fn apply_live_change(&self, doc_id: &str, remote: &RemoteNoteDocument) -> Result<Applied> {
        let local = self.deps.notes.find_by_remote_id(doc_id).await?;
        let pending = self.pending_change_for(doc_id, local.as_ref()).await?;
        if pending.is_some_and(|change| change.status.is_unsynced()) {
            // the next push settles it against the remote version
            debug!("Skipping live change for {doc_id}, a local edit is pending");
            return Ok(Applied::Kept);
        }
        self.reconcile(doc_id, remote).await
    }
}

fn deferred_entry(doc_id: String, remote: RemoteNoteDocument) -> PendingRemoteSync {
    let mut entry = PendingRemoteSync::new(doc_id, remote);
    entry.last_error = Some(Error::EncryptionNotReady.to_string());
    entry
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::models::{
        remote_reference, AttachmentKind, NotePayload, RemoteAttachment,
    };
    use crate::ports::NoteStore;
    use crate::state::SyncEvent;
    use crate::testing::{MemoryBlobStore, MemoryDocumentStore, TestDevice};
    use crate::util::{millis_to_datetime, unix_millis_now};

    use super::*;

    fn plain_doc(title: &str, updated_at: i64) -> RemoteNoteDocument {
        let mut doc = RemoteNoteDocument::tombstone(9, millis_to_datetime(updated_at));
        doc.deleted = Some(false);
        doc.payload = Some(NotePayload {
            title: title.to_string(),
            ..NotePayload::default()
        });
        doc
    }

    async fn listening_device() -> TestDevice {
        let device = TestDevice::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
        )
        .await;
        device.coordinator.start().await.unwrap();
        assert!(device.coordinator.is_listening());
        device
    }

    async fn next_event(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_change_is_applied_and_advances_watermark() {
        let device = listening_device().await;
        let mut events = device.coordinator.subscribe_events();
        let at = unix_millis_now();
        device.documents.put_document("live", &plain_doc("From elsewhere", at));

        device.documents.emit(&["live"]).await;

        let SyncEvent::NoteApplied(id) = next_event(&mut events).await else {
            panic!("expected an applied note");
        };
        let note = device.db.get_note(id).await.unwrap().unwrap();
        assert_eq!(note.title, "From elsewhere");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            device.coordinator.cache_metadata().await.unwrap().last_synced_at,
            Some(millis_to_datetime(at))
        );
    }

    fn with_memo(mut doc: RemoteNoteDocument, key: &str) -> RemoteNoteDocument {
        doc.attachments.push(RemoteAttachment {
            kind: AttachmentKind::Audio,
            path: remote_reference(key),
            metadata: Default::default(),
        });
        doc
    }

    fn modified(doc_id: &str, doc: &RemoteNoteDocument) -> RemoteChange {
        RemoteChange {
            kind: ChangeKind::Modified,
            document: crate::ports::RemoteDocument {
                id: doc_id.to_string(),
                data: doc.to_value().unwrap(),
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_entry_is_queued_for_the_next_pull() {
        let device = listening_device().await;
        let mut events = device.coordinator.subscribe_events();
        let at = unix_millis_now();
        device.documents.put_document("fine", &plain_doc("Fine", at));
        let broken = with_memo(plain_doc("Broken", at + 1), "notes/user-1/broken/memo.m4a");
        device.documents.put_document("broken", &broken);
        device.blobs.insert("notes/user-1/broken/memo.m4a", b"audio".to_vec());
        device.blobs.fail_gets(true);

        device.documents.emit(&["fine", "broken"]).await;

        assert!(matches!(next_event(&mut events).await, SyncEvent::NoteApplied(_)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(device.db.find_by_remote_id("broken").await.unwrap().is_none());
        let metadata = device.coordinator.cache_metadata().await.unwrap();
        assert!(metadata.is_resumable());

        device.blobs.fail_gets(false);
        device.coordinator.refresh().await;

        let note = device.db.find_by_remote_id("broken").await.unwrap().unwrap();
        assert_eq!(note.title, "Broken");
        assert_eq!(note.attachments.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn later_batch_does_not_skip_an_earlier_failure() {
        let device = TestDevice::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(MemoryBlobStore::default()),
        )
        .await;
        let inner = &device.coordinator.inner;
        let at = unix_millis_now();
        let broken = with_memo(plain_doc("Broken", at), "notes/user-1/broken/memo.m4a");
        device.documents.put_document("broken", &broken);
        device.blobs.insert("notes/user-1/broken/memo.m4a", b"audio".to_vec());
        let later = plain_doc("Later", at + 10);
        device.documents.put_document("later", &later);

        device.blobs.fail_gets(true);
        assert!(!inner.handle_remote_batch(vec![modified("broken", &broken)]).await);
        device.blobs.fail_gets(false);
        assert!(inner.handle_remote_batch(vec![modified("later", &later)]).await);
        assert_eq!(
            device.coordinator.cache_metadata().await.unwrap().last_synced_at,
            Some(millis_to_datetime(at + 10))
        );

        let report = device.coordinator.refresh().await;

        assert_eq!(report.applied, 1);
        let note = device.db.find_by_remote_id("broken").await.unwrap().unwrap();
        assert_eq!(note.title, "Broken");
        assert!(device.coordinator.cache_metadata().await.unwrap().sync_complete);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_local_edit_is_not_overwritten() {
        let device = listening_device().await;
        let note = device.create("Mine", "local").await;
        device.coordinator.refresh().await;
        let mut edited = device.db.get_note(note.id).await.unwrap().unwrap();
        edited.content = "unpushed".to_string();
        device.db.update_note(&edited).await.unwrap();
        let remote_id = edited.remote_id.clone().unwrap();

        let mut newer = plain_doc("Theirs", unix_millis_now() + 60_000);
        newer.local_id = note.id;
        device.documents.put_document(&remote_id, &newer);

        let batch = vec![modified(&remote_id, &newer)];
        assert!(device.coordinator.inner.handle_remote_batch(batch).await);

        let local = device.db.get_note(note.id).await.unwrap().unwrap();
        assert_eq!(local.content, "unpushed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_and_dispose_end_the_subscription() {
        let device = listening_device().await;
        device.coordinator.stop_realtime_listener();
        assert!(!device.coordinator.is_listening());

        device.coordinator.start_realtime_listener().await.unwrap();
        assert!(device.coordinator.is_listening());
        device.coordinator.dispose();
        assert!(!device.coordinator.is_listening());
    }
}
