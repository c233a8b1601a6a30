//! Durable, paginated queue of remote changes waiting to be applied locally.
//!
//! Layout under `<documents>/sync_cache/`:
//!
//! - `metadata.json`: session state and the remote watermark
//! - `page_<n>.json`: one fetched page of pending entries
//!
//! Every file is replaced atomically (write to `*.tmp`, then rename). A page
//! file exists only while it still holds entries; once its last entry
//! completes the file is removed. All mutations go through one async mutex,
//! which makes the cache a single writer.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{LocalId, RemoteNoteDocument};
use crate::ports::{ChangeQuery, DocumentCursor, FileSystem};
use crate::util::with_timeout;

const CACHE_DIR: &str = "sync_cache";
const METADATA_FILE: &str = "metadata.json";
const PAGE_PREFIX: &str = "page_";

/// Processing state of a cached remote change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteSyncStatus {
    #[default]
    Pending,
    InProgress,
    Failed,
}

/// One remote document not yet applied locally.
// keyed by remote_doc_id: local ids are per device and collide across devices
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRemoteSync {
    /// Local id recorded by the device that created the note
    pub local_id: LocalId,
    pub remote_doc_id: String,
    pub remote_data: RemoteNoteDocument,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: RemoteSyncStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingRemoteSync {
    #[must_use]
    pub fn new(remote_doc_id: impl Into<String>, remote_data: RemoteNoteDocument) -> Self {
        Self {
            local_id: remote_data.local_id,
            remote_doc_id: remote_doc_id.into(),
            remote_data,
            fetched_at: Utc::now(),
            retry_count: 0,
            status: RemoteSyncStatus::Pending,
            last_error: None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(
            self.status,
            RemoteSyncStatus::Pending | RemoteSyncStatus::Failed
        )
    }
}

/// A fetched page of remote changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCachePage {
    pub page_index: u32,
    pub entries: Vec<PendingRemoteSync>,
    pub last_document_id: Option<String>,
    pub has_more: bool,
}

/// Session level state of the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCacheMetadata {
    /// Watermark: remote documents up to this timestamp have been fetched
    pub last_synced_at: Option<DateTime<Utc>>,
    pub total_pages: u32,
    pub all_pages_fetched: bool,
    /// `all_pages_fetched` and no entry left in any page
    pub sync_complete: bool,
    /// Freshness of the cached remote data
    pub updated_at: Option<DateTime<Utc>>,
    /// Pages that still have a file on disk
    pub outstanding_pages: BTreeSet<u32>,
    /// Exact position of the last fetched document
    pub cursor: Option<DocumentCursor>,
    /// A session was started and not yet superseded
    pub active: bool,
}

impl SyncCacheMetadata {
    /// Whether an unfinished session can be picked up again.
    #[must_use]
    pub const fn is_resumable(&self) -> bool {
        self.active && !self.sync_complete
    }
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    metadata: SyncCacheMetadata,
    pages: BTreeMap<u32, SyncCachePage>,
}

impl CacheState {
    fn locate(&self, doc_id: &str) -> Option<(u32, usize)> {
        self.pages.iter().find_map(|(index, page)| {
            page.entries
                .iter()
                .position(|entry| entry.remote_doc_id == doc_id)
                .map(|position| (*index, position))
        })
    }
}

/// File backed cache of one pull session.
pub struct PersistentSyncCache {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    io_timeout: Duration,
    state: Mutex<CacheState>,
}

impl PersistentSyncCache {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, io_timeout: Duration) -> Self {
        let dir = fs.documents_dir().join(CACHE_DIR);
        Self {
            fs,
            dir,
            io_timeout,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Read the cache from disk once; later calls are no-ops.
    ///
    /// Entries left `in_progress` by an interrupted process are reset to
    /// `pending`. Unreadable cache files discard the whole cache.
    pub async fn load(&self) -> Result<()> {
        self.lock_loaded().await.map(drop)
    }

    pub async fn metadata(&self) -> Result<SyncCacheMetadata> {
        Ok(self.lock_loaded().await?.metadata.clone())
    }

    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock_loaded().await?.metadata.last_synced_at)
    }

    pub async fn is_resumable(&self) -> Result<bool> {
        Ok(self.lock_loaded().await?.metadata.is_resumable())
    }

    /// Query for the next page after everything fetched so far.
    pub async fn next_query(&self, limit: usize) -> Result<ChangeQuery> {
        let state = self.lock_loaded().await?;
        let metadata = &state.metadata;
        Ok(match &metadata.cursor {
            Some(cursor) => ChangeQuery {
                after: None,
                start_after: Some(cursor.clone()),
                limit,
            },
            None => ChangeQuery {
                after: metadata.last_synced_at,
                start_after: None,
                limit,
            },
        })
    }

    /// Drop all pages and begin a fresh session anchored at `watermark`.
    pub async fn start_new_sync(&self, watermark: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        self.remove_all_files().await?;

        // the old cursor still pins the exact position when it matches the anchor
        let cursor = state
            .metadata
            .cursor
            .take()
            .filter(|cursor| Some(cursor.updated_at) == watermark);

        state.pages.clear();
        state.metadata = SyncCacheMetadata {
            last_synced_at: watermark,
            updated_at: Some(Utc::now()),
            cursor,
            active: true,
            ..SyncCacheMetadata::default()
        };
        self.persist_metadata(&mut state).await?;

        info!(
            "Started sync session at watermark {}",
            watermark.map_or_else(|| "none".to_string(), |at| at.to_rfc3339())
        );
        Ok(())
    }

    /// Persist a fetched page and advance the watermark to its last document.
    ///
    /// Entries replace older cached entries for the same document. Returns the
    /// index assigned to the page.
    pub async fn add_page(
        &self,
        entries: Vec<PendingRemoteSync>,
        last_document_id: Option<String>,
        cursor: Option<DocumentCursor>,
        has_more: bool,
    ) -> Result<u32> {
        let mut state = self.lock_loaded().await?;
        let index = self
            .insert_page(&mut state, entries, last_document_id, has_more)
            .await?;

        let metadata = &mut state.metadata;
        metadata.all_pages_fetched = !has_more;
        metadata.updated_at = Some(Utc::now());
        if let Some(cursor) = cursor {
            metadata.last_synced_at = metadata.last_synced_at.max(Some(cursor.updated_at));
            if metadata.cursor.as_ref().map_or(true, |current| &cursor > current) {
                metadata.cursor = Some(cursor);
            }
        }
        self.persist_metadata(&mut state).await?;

        debug!("Cached sync page {index}");
        Ok(index)
    }

    /// Queue entries that arrived outside a paged fetch, such as live changes
    /// that could not be applied yet. The next drain retries them; the
    /// watermark and cursor stay where they are.
    pub async fn enqueue(&self, entries: Vec<PendingRemoteSync>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.lock_loaded().await?;
        let count = entries.len();
        let index = self.insert_page(&mut state, entries, None, false).await?;
        state.metadata.active = true;
        self.persist_metadata(&mut state).await?;

        info!("Queued {count} remote changes for retry in page {index}");
        Ok(())
    }

    async fn insert_page(
        &self,
        state: &mut CacheState,
        entries: Vec<PendingRemoteSync>,
        last_document_id: Option<String>,
        has_more: bool,
    ) -> Result<u32> {
        let mut seen = HashSet::new();
        let mut entries: Vec<_> = entries
            .into_iter()
            .rev()
            .filter(|entry| seen.insert(entry.remote_doc_id.clone()))
            .collect();
        entries.reverse();

        let superseded: Vec<u32> = state
            .pages
            .iter_mut()
            .filter_map(|(index, page)| {
                let before = page.entries.len();
                page.entries
                    .retain(|entry| !seen.contains(&entry.remote_doc_id));
                (page.entries.len() != before).then_some(*index)
            })
            .collect();
        for index in superseded {
            self.persist_page(state, index).await?;
        }

        let index = state.metadata.total_pages;
        if !entries.is_empty() {
            state.pages.insert(
                index,
                SyncCachePage {
                    page_index: index,
                    entries,
                    last_document_id,
                    has_more,
                },
            );
            state.metadata.outstanding_pages.insert(index);
            self.persist_page(state, index).await?;
        }
        state.metadata.total_pages += 1;
        Ok(index)
    }

    /// Record that the remote feed has no further pages right now.
    pub async fn mark_all_fetched(&self) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        state.metadata.all_pages_fetched = true;
        state.metadata.updated_at = Some(Utc::now());
        self.persist_metadata(&mut state).await
    }

    /// Entries with status `pending` or `failed`, in fetch order.
    pub async fn get_pending_syncs(&self) -> Result<Vec<PendingRemoteSync>> {
        let state = self.lock_loaded().await?;
        Ok(state
            .pages
            .values()
            .flat_map(|page| page.entries.iter())
            .filter(|entry| entry.is_pending())
            .cloned()
            .collect())
    }

    pub async fn mark_in_progress(&self, doc_id: &str) -> Result<()> {
        self.update_entry(doc_id, |entry| {
            entry.status = RemoteSyncStatus::InProgress;
        })
        .await
    }

    /// Remove an applied entry, deleting its page once the page is empty.
    pub async fn mark_completed(&self, doc_id: &str) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        let Some((index, position)) = state.locate(doc_id) else {
            return Ok(());
        };

        if let Some(page) = state.pages.get_mut(&index) {
            page.entries.remove(position);
        }
        self.persist_page(&mut state, index).await?;
        self.persist_metadata(&mut state).await
    }

    /// Complete an entry applied at version `applied_at`. A newer version
    /// queued meanwhile stays pending instead.
    pub async fn mark_applied(&self, doc_id: &str, applied_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        let Some((index, position)) = state.locate(doc_id) else {
            return Ok(());
        };
        let Some(page) = state.pages.get_mut(&index) else {
            return Ok(());
        };

        let Some(entry) = page.entries.get_mut(position) else {
            return Ok(());
        };
        if entry.remote_data.updated_at > applied_at {
            debug!("Newer version of {doc_id} is queued, keeping it");
            entry.status = RemoteSyncStatus::Pending;
            return self.persist_page(&mut state, index).await;
        }

        page.entries.remove(position);
        self.persist_page(&mut state, index).await?;
        self.persist_metadata(&mut state).await
    }

    pub async fn mark_failed(&self, doc_id: &str, error: &str) -> Result<()> {
        self.update_entry(doc_id, |entry| {
            entry.status = RemoteSyncStatus::Failed;
            entry.retry_count = entry.retry_count.saturating_add(1);
            entry.last_error = Some(error.to_string());
        })
        .await
    }

    /// Keep an entry for a later drain without counting it as a failure.
    pub async fn mark_deferred(&self, doc_id: &str) -> Result<()> {
        self.update_entry(doc_id, |entry| {
            entry.status = RemoteSyncStatus::Pending;
            entry.last_error = Some(Error::EncryptionNotReady.to_string());
        })
        .await
    }

    /// Put an entry back untouched, for another pass to pick up.
    pub async fn release(&self, doc_id: &str) -> Result<()> {
        self.update_entry(doc_id, |entry| entry.status = RemoteSyncStatus::Pending)
            .await
    }

    /// Replace cached data with a fresh copy from the server, or drop the
    /// entry when the document no longer exists.
    pub async fn refresh_entry(&self, doc_id: &str, fresh: Option<RemoteNoteDocument>) -> Result<()> {
        let Some(fresh) = fresh else {
            return self.mark_completed(doc_id).await;
        };

        self.update_entry(doc_id, move |entry| {
            if entry.remote_data != fresh {
                entry.remote_data = fresh;
                entry.fetched_at = Utc::now();
                entry.retry_count = 0;
                entry.last_error = None;
            }
            if entry.status == RemoteSyncStatus::InProgress {
                entry.status = RemoteSyncStatus::Pending;
            }
        })
        .await
    }

    /// Mark cached data as freshly validated against the server.
    pub async fn touch(&self) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        state.metadata.updated_at = Some(Utc::now());
        self.persist_metadata(&mut state).await
    }

    /// Whether cached data is older than `threshold`.
    pub async fn is_cache_stale(&self, threshold: Duration) -> Result<bool> {
        let state = self.lock_loaded().await?;
        let Some(updated_at) = state.metadata.updated_at else {
            return Ok(true);
        };
        let age = Utc::now()
            .signed_duration_since(updated_at)
            .to_std()
            .unwrap_or_default();
        Ok(age > threshold)
    }

    /// Move the watermark forward; older timestamps are ignored.
    pub async fn advance_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        if state.metadata.last_synced_at >= Some(at) {
            return Ok(());
        }
        state.metadata.last_synced_at = Some(at);
        self.persist_metadata(&mut state).await
    }

    /// Forget everything, including the watermark.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        self.remove_all_files().await?;
        state.pages.clear();
        state.metadata = SyncCacheMetadata::default();
        info!("Cleared sync cache");
        Ok(())
    }

    async fn lock_loaded(&self) -> Result<MutexGuard<'_, CacheState>> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            self.load_from_disk(&mut state).await?;
            state.loaded = true;
        }
        Ok(state)
    }

    async fn load_from_disk(&self, state: &mut CacheState) -> Result<()> {
        match self.read_state().await {
            Ok((metadata, pages)) => {
                state.metadata = metadata;
                state.pages = pages;
            }
            Err(error) => {
                warn!("Discarding unreadable sync cache: {error}");
                self.remove_all_files().await?;
                *state = CacheState::default();
                return Ok(());
            }
        }

        // drop pages without a metadata entry, left behind by an interrupted add
        for path in self.list_cache_files().await? {
            let orphan = page_index_of(&path)
                .is_some_and(|index| !state.metadata.outstanding_pages.contains(&index));
            if orphan || path.extension().is_some_and(|ext| ext == "tmp") {
                self.remove_file(&path).await?;
            }
        }

        let mut interrupted = Vec::new();
        for (index, page) in &mut state.pages {
            let mut touched = false;
            for entry in &mut page.entries {
                if entry.status == RemoteSyncStatus::InProgress {
                    entry.status = RemoteSyncStatus::Pending;
                    touched = true;
                }
            }
            if touched {
                interrupted.push(*index);
            }
        }
        for index in interrupted {
            self.persist_page(state, index).await?;
        }

        state.metadata.outstanding_pages = state.pages.keys().copied().collect();
        if state.metadata.active {
            self.persist_metadata(state).await?;
        }

        if state.metadata.is_resumable() {
            info!(
                "Loaded sync cache with {} outstanding pages",
                state.pages.len()
            );
        }
        Ok(())
    }

    async fn read_state(&self) -> Result<(SyncCacheMetadata, BTreeMap<u32, SyncCachePage>)> {
        let Some(metadata) = self
            .read_json::<SyncCacheMetadata>(&self.dir.join(METADATA_FILE))
            .await?
        else {
            return Ok((SyncCacheMetadata::default(), BTreeMap::new()));
        };

        let mut pages = BTreeMap::new();
        for index in &metadata.outstanding_pages {
            // a missing page was compacted before the metadata write landed
            if let Some(page) = self.read_json::<SyncCachePage>(&self.page_path(*index)).await? {
                if !page.entries.is_empty() {
                    pages.insert(*index, page);
                }
            }
        }
        Ok((metadata, pages))
    }

    async fn update_entry(
        &self,
        doc_id: &str,
        update: impl FnOnce(&mut PendingRemoteSync),
    ) -> Result<()> {
        let mut state = self.lock_loaded().await?;
        let Some((index, position)) = state.locate(doc_id) else {
            return Ok(());
        };

        if let Some(entry) = state
            .pages
            .get_mut(&index)
            .and_then(|page| page.entries.get_mut(position))
        {
            update(entry);
        }
        self.persist_page(&mut state, index).await
    }

    async fn persist_page(&self, state: &mut CacheState, index: u32) -> Result<()> {
        match state.pages.get(&index) {
            Some(page) if !page.entries.is_empty() => {
                self.write_json(&self.page_path(index), page).await
            }
            _ => {
                state.pages.remove(&index);
                state.metadata.outstanding_pages.remove(&index);
                debug!("Compacted sync page {index}");
                self.remove_file(&self.page_path(index)).await
            }
        }
    }

    async fn persist_metadata(&self, state: &mut CacheState) -> Result<()> {
        let metadata = &mut state.metadata;
        metadata.sync_complete = metadata.all_pages_fetched && state.pages.is_empty();
        self.write_json(&self.dir.join(METADATA_FILE), metadata).await
    }

    fn page_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{PAGE_PREFIX}{index}.json"))
    }

    async fn list_cache_files(&self) -> Result<Vec<PathBuf>> {
        with_timeout(
            "sync cache list",
            self.io_timeout,
            self.fs.list_files(&self.dir),
        )
        .await
    }

    async fn remove_all_files(&self) -> Result<()> {
        for path in self.list_cache_files().await? {
            self.remove_file(&path).await?;
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        with_timeout("sync cache delete", self.io_timeout, self.fs.delete(path)).await
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let temp = path.with_extension("json.tmp");
        with_timeout("sync cache write", self.io_timeout, async {
            self.fs.write(&temp, &bytes).await?;
            self.fs.rename(&temp, path).await
        })
        .await
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = with_timeout("sync cache read", self.io_timeout, async {
            if self.fs.exists(path).await? {
                self.fs.read(path).await.map(Some)
            } else {
                Ok(None)
            }
        })
        .await?;

        bytes
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|error| Error::Cache(format!("{}: {error}", path.display())))
            })
            .transpose()
    }
}

fn page_index_of(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PAGE_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotePayload, REMOTE_SCHEMA_VERSION};
    use crate::storage::LocalFileSystem;
    use crate::util::millis_to_datetime;
    use pretty_assertions::assert_eq;

    fn cache_in(dir: &Path) -> PersistentSyncCache {
        PersistentSyncCache::new(Arc::new(LocalFileSystem::new(dir)), Duration::from_secs(5))
    }

    fn doc(local_id: LocalId, updated_at: i64) -> RemoteNoteDocument {
        RemoteNoteDocument {
            schema_version: REMOTE_SCHEMA_VERSION,
            local_id,
            updated_at: millis_to_datetime(updated_at),
            deleted: Some(false),
            payload: Some(NotePayload {
                title: format!("note {local_id}"),
                ..NotePayload::default()
            }),
            encrypted_payload: None,
            attachments: Vec::new(),
        }
    }

    fn entry(id: LocalId, updated_at: i64) -> PendingRemoteSync {
        PendingRemoteSync::new(format!("doc-{id}"), doc(id, updated_at))
    }

    fn cursor(id: LocalId, updated_at: i64) -> Option<DocumentCursor> {
        Some(DocumentCursor {
            updated_at: millis_to_datetime(updated_at),
            doc_id: format!("doc-{id}"),
        })
    }

    fn pending_ids(entries: &[PendingRemoteSync]) -> Vec<&str> {
        entries
            .iter()
            .map(|entry| entry.remote_doc_id.as_str())
            .collect()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn completing_every_entry_compacts_the_page() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        let index = cache
            .add_page(
                vec![entry(1, 10), entry(2, 20), entry(3, 30)],
                Some("doc-3".to_string()),
                cursor(3, 30),
                true,
            )
            .await
            .unwrap();
        assert_eq!(index, 0);
        let page_file = tmp.path().join("sync_cache/page_0.json");

        cache.mark_completed("doc-2").await.unwrap();
        assert_eq!(
            pending_ids(&cache.get_pending_syncs().await.unwrap()),
            vec!["doc-1", "doc-3"]
        );
        assert!(page_file.exists());

        cache.mark_completed("doc-1").await.unwrap();
        cache.mark_completed("doc-3").await.unwrap();
        assert!(!page_file.exists());

        let metadata = cache.metadata().await.unwrap();
        assert!(metadata.outstanding_pages.is_empty());
        assert!(!metadata.sync_complete, "more pages still to fetch");

        cache.mark_all_fetched().await.unwrap();
        assert!(cache.metadata().await.unwrap().sync_complete);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn restart_resumes_remaining_work_and_resets_in_progress() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = cache_in(tmp.path());
            cache.start_new_sync(None).await.unwrap();
            cache
                .add_page(vec![entry(1, 10), entry(2, 20)], None, cursor(2, 20), true)
                .await
                .unwrap();
            cache
                .add_page(vec![entry(3, 30)], None, cursor(3, 30), true)
                .await
                .unwrap();
            cache.mark_completed("doc-1").await.unwrap();
            cache.mark_in_progress("doc-2").await.unwrap();
            cache.mark_failed("doc-3", "offline").await.unwrap();
        }

        let cache = cache_in(tmp.path());
        assert!(cache.is_resumable().await.unwrap());
        assert_eq!(cache.watermark().await.unwrap(), Some(millis_to_datetime(30)));

        let pending = cache.get_pending_syncs().await.unwrap();
        assert_eq!(pending_ids(&pending), vec!["doc-2", "doc-3"]);
        assert_eq!(pending[0].status, RemoteSyncStatus::Pending);
        assert_eq!(pending[1].retry_count, 1);
        assert_eq!(pending[1].last_error.as_deref(), Some("offline"));

        let query = cache.next_query(20).await.unwrap();
        assert_eq!(query.start_after, cursor(3, 30));
        assert_eq!(query.after, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn newer_page_supersedes_cached_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 10)], None, cursor(1, 10), true)
            .await
            .unwrap();
        cache.mark_failed("doc-1", "timeout").await.unwrap();

        cache
            .add_page(vec![entry(1, 50), entry(2, 60)], None, cursor(2, 60), false)
            .await
            .unwrap();

        let pending = cache.get_pending_syncs().await.unwrap();
        assert_eq!(pending_ids(&pending), vec!["doc-1", "doc-2"]);
        assert_eq!(pending[0].remote_data.updated_at_millis(), 50);
        assert_eq!(pending[0].retry_count, 0);
        assert!(!tmp.path().join("sync_cache/page_0.json").exists());
        assert_eq!(
            cache.metadata().await.unwrap().outstanding_pages,
            BTreeSet::from([1])
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn watermark_never_moves_backwards() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 100)], None, cursor(1, 100), true)
            .await
            .unwrap();

        cache.advance_watermark(millis_to_datetime(40)).await.unwrap();
        assert_eq!(cache.watermark().await.unwrap(), Some(millis_to_datetime(100)));

        cache.mark_failed("doc-1", "network").await.unwrap();
        cache
            .add_page(Vec::new(), None, cursor(0, 90), false)
            .await
            .unwrap();
        assert_eq!(cache.watermark().await.unwrap(), Some(millis_to_datetime(100)));

        cache.advance_watermark(millis_to_datetime(150)).await.unwrap();
        assert_eq!(cache.watermark().await.unwrap(), Some(millis_to_datetime(150)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn new_session_keeps_watermark_and_exact_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 70)], None, cursor(1, 70), false)
            .await
            .unwrap();
        cache.mark_completed("doc-1").await.unwrap();
        assert!(!cache.is_resumable().await.unwrap());

        let watermark = cache.watermark().await.unwrap();
        cache.start_new_sync(watermark).await.unwrap();

        let metadata = cache.metadata().await.unwrap();
        assert!(metadata.is_resumable());
        assert_eq!(metadata.total_pages, 0);
        assert_eq!(metadata.last_synced_at, Some(millis_to_datetime(70)));
        assert_eq!(metadata.cursor, cursor(1, 70));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn enqueued_entries_reopen_a_finished_session() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 10)], None, cursor(1, 10), false)
            .await
            .unwrap();
        cache.mark_completed("doc-1").await.unwrap();
        cache.advance_watermark(millis_to_datetime(50)).await.unwrap();
        assert!(!cache.is_resumable().await.unwrap());

        cache.enqueue(vec![entry(2, 30)]).await.unwrap();

        let metadata = cache.metadata().await.unwrap();
        assert!(metadata.is_resumable());
        assert_eq!(metadata.last_synced_at, Some(millis_to_datetime(50)));
        assert_eq!(metadata.cursor, cursor(1, 10));

        let reopened = cache_in(tmp.path());
        assert_eq!(pending_ids(&reopened.get_pending_syncs().await.unwrap()), vec!["doc-2"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn applying_an_older_version_keeps_the_newer_queued_one() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 10)], None, cursor(1, 10), false)
            .await
            .unwrap();
        cache.mark_in_progress("doc-1").await.unwrap();

        cache.enqueue(vec![entry(1, 20)]).await.unwrap();
        cache
            .mark_applied("doc-1", millis_to_datetime(10))
            .await
            .unwrap();

        let pending = cache.get_pending_syncs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].remote_data.updated_at, millis_to_datetime(20));

        cache
            .mark_applied("doc-1", millis_to_datetime(20))
            .await
            .unwrap();
        assert!(cache.get_pending_syncs().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deferred_entries_stay_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 10)], None, cursor(1, 10), false)
            .await
            .unwrap();

        cache.mark_in_progress("doc-1").await.unwrap();
        cache.mark_deferred("doc-1").await.unwrap();

        let pending = cache.get_pending_syncs().await.unwrap();
        assert_eq!(pending[0].status, RemoteSyncStatus::Pending);
        assert_eq!(pending[0].retry_count, 0);
        assert!(!cache.metadata().await.unwrap().sync_complete);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn refresh_replaces_stale_data_or_drops_vanished_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 10), entry(2, 20)], None, cursor(2, 20), false)
            .await
            .unwrap();
        cache.mark_failed("doc-1", "timeout").await.unwrap();

        cache.refresh_entry("doc-1", Some(doc(1, 99))).await.unwrap();
        cache.refresh_entry("doc-2", None).await.unwrap();

        let pending = cache.get_pending_syncs().await.unwrap();
        assert_eq!(pending_ids(&pending), vec!["doc-1"]);
        assert_eq!(pending[0].remote_data.updated_at_millis(), 99);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].last_error, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn staleness_follows_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        assert!(cache.is_cache_stale(Duration::from_secs(300)).await.unwrap());

        cache.start_new_sync(None).await.unwrap();
        assert!(!cache.is_cache_stale(Duration::from_secs(300)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_cache_stale(Duration::from_millis(1)).await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreadable_cache_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sync_cache");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("metadata.json"), b"{not json").unwrap();
        std::fs::write(dir.join("page_4.json"), b"[]").unwrap();

        let cache = cache_in(tmp.path());
        assert_eq!(cache.metadata().await.unwrap(), SyncCacheMetadata::default());
        assert!(!dir.join("page_4.json").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clear_resets_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_in(tmp.path());
        cache.start_new_sync(None).await.unwrap();
        cache
            .add_page(vec![entry(1, 10)], None, cursor(1, 10), false)
            .await
            .unwrap();

        cache.clear().await.unwrap();

        assert_eq!(cache.watermark().await.unwrap(), None);
        assert!(cache.get_pending_syncs().await.unwrap().is_empty());
        assert!(!cache.is_resumable().await.unwrap());
    }
}
