//! In-memory stand-ins for the remote and platform ports, used by tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{Note, RemoteNoteDocument};
use crate::ports::{
    ChangeKind, ChangeQuery, DocumentCursor, DocumentWrite, EncryptionProvider,
    EntitlementProvider, RemoteBlobStore, RemoteChange, RemoteDocument, RemoteDocumentStore,
    Session, SessionProvider,
};
use crate::services::DatabaseService;
use crate::storage::LocalFileSystem;
use crate::sync::{SyncCoordinator, SyncDeps};

const MAGIC: &[u8] = b"FAKE1";

/// Reversible byte scrambling with a recognizable header.
pub struct FakeEncryption {
    ready: AtomicBool,
}

impl FakeEncryption {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl EncryptionProvider for FakeEncryption {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.is_ready() {
            return Err(Error::EncryptionNotReady);
        }
        let mut out = MAGIC.to_vec();
        out.extend(plaintext.iter().map(|byte| byte ^ 0x5a));
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if !self.is_ready() {
            return Err(Error::EncryptionNotReady);
        }
        let body = ciphertext
            .strip_prefix(MAGIC)
            .ok_or_else(|| Error::Decryption("missing header".to_string()))?;
        Ok(body.iter().map(|byte| byte ^ 0x5a).collect())
    }

    fn looks_encrypted(&self, data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }
}

pub struct StaticEntitlement(AtomicBool);

impl StaticEntitlement {
    pub fn new(paid: bool) -> Self {
        Self(AtomicBool::new(paid))
    }

    pub fn set_paid(&self, paid: bool) {
        self.0.store(paid, Ordering::SeqCst);
    }
}

impl EntitlementProvider for StaticEntitlement {
    fn is_paid(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct StaticSession(Mutex<Option<Session>>);

impl StaticSession {
    pub fn signed_in(user_id: &str) -> Self {
        let session = Self(Mutex::new(None));
        session.sign_in(user_id);
        session
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.0.lock().unwrap() = Some(Session {
            user_id: user_id.to_string(),
            restricted: false,
        });
    }

    pub fn sign_out(&self) {
        *self.0.lock().unwrap() = None;
    }
}

impl SessionProvider for StaticSession {
    fn current_session(&self) -> Option<Session> {
        self.0.lock().unwrap().clone()
    }
}

/// Blob store with call counters and an optional hanging `put`.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    gets: AtomicUsize,
    stall_puts: AtomicBool,
    fail_gets: AtomicBool,
}

impl MemoryBlobStore {
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Make every following `put` hang until it times out.
    pub fn stall_puts(&self, stall: bool) {
        self.stall_puts.store(stall, Ordering::SeqCst);
    }

    /// Make every following `get` fail with a network error.
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteBlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        if self.stall_puts.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert(key, bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Error::Network("connection refused".to_string()));
        }
        self.object(key)
            .ok_or_else(|| Error::ObjectNotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

/// Document store with failure injection and a manually driven change feed.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<String, Value>>,
    next_id: AtomicU64,
    failing_commits: AtomicUsize,
    commits: AtomicUsize,
    queries: AtomicUsize,
    fail_gets: AtomicBool,
    commit_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<RemoteChange>>>>,
}

impl MemoryDocumentStore {
    pub fn put_document(&self, doc_id: &str, doc: &RemoteNoteDocument) {
        self.documents
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), doc.to_value().unwrap());
    }

    pub fn document(&self, doc_id: &str) -> Option<RemoteNoteDocument> {
        let value = self.documents.lock().unwrap().get(doc_id).cloned()?;
        Some(RemoteNoteDocument::from_value(doc_id, value).unwrap())
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    /// Fail the next `count` commits with a network error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Make every following `get` fail with a network error.
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Park the next commit until released. Returns the notifier signalled
    /// when the commit arrives and the one that lets it proceed.
    pub fn hold_commits(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.commit_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Deliver a batch of current documents to every live subscriber.
    pub async fn emit(&self, doc_ids: &[&str]) {
        let batch: Vec<RemoteChange> = {
            let documents = self.documents.lock().unwrap();
            doc_ids
                .iter()
                .filter_map(|id| {
                    documents.get(*id).map(|data| RemoteChange {
                        kind: ChangeKind::Modified,
                        document: RemoteDocument {
                            id: (*id).to_string(),
                            data: data.clone(),
                        },
                    })
                })
                .collect()
        };
        let subscribers: Vec<_> = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.send(batch.clone()).await;
        }
    }
}

fn cursor_of(id: &str, data: &Value) -> Option<DocumentCursor> {
    let updated_at: DateTime<Utc> = data.get("updated_at")?.as_str()?.parse().ok()?;
    Some(DocumentCursor {
        updated_at,
        doc_id: id.to_string(),
    })
}

#[async_trait]
impl RemoteDocumentStore for MemoryDocumentStore {
    fn new_document_id(&self) -> String {
        format!("doc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn get(&self, doc_id: &str) -> Result<Option<RemoteDocument>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Error::Network("connection refused".to_string()));
        }
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(doc_id)
            .map(|data| RemoteDocument {
                id: doc_id.to_string(),
                data: data.clone(),
            }))
    }

    async fn set_merge(&self, doc_id: &str, data: Value) -> Result<()> {
        self.commit(vec![DocumentWrite {
            doc_id: doc_id.to_string(),
            data,
        }])
        .await
    }

    async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let gate = self.commit_gate.lock().unwrap().take();
        if let Some((arrived, release)) = gate {
            arrived.notify_one();
            release.notified().await;
        }
        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Network("connection reset".to_string()));
        }

        let mut documents = self.documents.lock().unwrap();
        for write in writes {
            let entry = documents
                .entry(write.doc_id)
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let (Value::Object(target), Value::Object(fields)) = (entry, write.data) {
                target.extend(fields);
            }
        }
        Ok(())
    }

    async fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<RemoteDocument>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let documents = self.documents.lock().unwrap();
        let mut matching: Vec<(DocumentCursor, RemoteDocument)> = documents
            .iter()
            .filter_map(|(id, data)| {
                let cursor = cursor_of(id, data)?;
                let after_ok = query.after.map_or(true, |after| cursor.updated_at > after);
                let start_ok = query
                    .start_after
                    .as_ref()
                    .map_or(true, |start| &cursor > start);
                (after_ok && start_ok).then(|| {
                    (
                        cursor,
                        RemoteDocument {
                            id: id.clone(),
                            data: data.clone(),
                        },
                    )
                })
            })
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matching
            .into_iter()
            .take(query.limit)
            .map(|(_, doc)| doc)
            .collect())
    }

    async fn subscribe(
        &self,
        _after: Option<DateTime<Utc>>,
    ) -> Result<mpsc::Receiver<Vec<RemoteChange>>> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// One simulated device: its own database, documents directory and gates,
/// sharing the remote stores with other devices.
pub struct TestDevice {
    pub tmp: tempfile::TempDir,
    pub db: Arc<DatabaseService>,
    pub encryption: Arc<FakeEncryption>,
    pub entitlement: Arc<StaticEntitlement>,
    pub session: Arc<StaticSession>,
    pub documents: Arc<MemoryDocumentStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub coordinator: SyncCoordinator,
}

impl TestDevice {
    pub async fn new(documents: Arc<MemoryDocumentStore>, blobs: Arc<MemoryBlobStore>) -> Self {
        Self::with_config(documents, blobs, test_config()).await
    }

    pub async fn with_config(
        documents: Arc<MemoryDocumentStore>,
        blobs: Arc<MemoryBlobStore>,
        config: SyncConfig,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(DatabaseService::open_in_memory().await.unwrap());
        let encryption = Arc::new(FakeEncryption::new(true));
        let entitlement = Arc::new(StaticEntitlement::new(true));
        let session = Arc::new(StaticSession::signed_in("user-1"));
        let coordinator = SyncCoordinator::new(
            SyncDeps {
                notes: db.clone(),
                ledger: db.clone(),
                file_tracks: db.clone(),
                encryption: encryption.clone(),
                entitlement: entitlement.clone(),
                session: session.clone(),
                documents: documents.clone(),
                blobs: blobs.clone(),
                fs: Arc::new(LocalFileSystem::new(tmp.path())),
            },
            config,
        );

        Self {
            tmp,
            db,
            encryption,
            entitlement,
            session,
            documents,
            blobs,
            coordinator,
        }
    }

    /// Same database and documents directory, fresh coordinator: a restart.
    pub fn restart(&mut self, config: SyncConfig) {
        self.coordinator.dispose();
        self.coordinator = SyncCoordinator::new(
            SyncDeps {
                notes: self.db.clone(),
                ledger: self.db.clone(),
                file_tracks: self.db.clone(),
                encryption: self.encryption.clone(),
                entitlement: self.entitlement.clone(),
                session: self.session.clone(),
                documents: self.documents.clone(),
                blobs: self.blobs.clone(),
                fs: Arc::new(LocalFileSystem::new(self.tmp.path())),
            },
            config,
        );
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.tmp.path().to_path_buf()
    }

    pub async fn create(&self, title: &str, content: &str) -> Note {
        self.db.create_note(&Note::new(title, content)).await.unwrap()
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 20,
        page_size: 2,
        ..SyncConfig::default()
    }
}
