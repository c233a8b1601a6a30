//! Shared-directory backends for the remote document and blob stores.
//!
//! A folder synced by an external tool (network share, Syncthing, a mounted
//! bucket) stands in for the cloud. Every write goes to a temp file that is
//! renamed into place so readers never observe half-written documents.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::ports::{
    ChangeKind, ChangeQuery, DocumentCursor, DocumentWrite, RemoteBlobStore, RemoteChange,
    RemoteDocument, RemoteDocumentStore,
};
use crate::{Error, Result};

use super::keys::normalize_object_key;

const FEED_CHANNEL_CAPACITY: usize = 16;

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::now_v7()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(error) = tokio::fs::rename(&tmp, path).await {
        tokio::fs::remove_file(&tmp).await.ok();
        return Err(error.into());
    }
    Ok(())
}

/// Blob store on a directory; object keys map to relative paths.
#[derive(Clone, Debug)]
pub struct FolderBlobStore {
    root: PathBuf,
}

impl FolderBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(normalize_object_key(key)?))
    }
}

#[async_trait]
impl RemoteBlobStore for FolderBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        write_atomically(&self.object_path(key)?, &bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(key.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(key)?).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(key)?).await?)
    }
}

/// Document store with one JSON file per document.
#[derive(Debug)]
pub struct FolderDocumentStore {
    dir: PathBuf,
    poll_interval: Duration,
    write_lock: Mutex<()>,
}

impl FolderDocumentStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            write_lock: Mutex::new(()),
        }
    }

    fn document_path(&self, doc_id: &str) -> Result<PathBuf> {
        let valid = !doc_id.is_empty()
            && doc_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(Error::InvalidInput(format!("invalid document id: {doc_id}")));
        }
        Ok(self.dir.join(format!("{doc_id}.json")))
    }

    async fn read_document(&self, doc_id: &str) -> Result<Option<Value>> {
        match tokio::fs::read(self.document_path(doc_id)?).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn merged(&self, doc_id: &str, data: Value) -> Result<Value> {
        let Value::Object(fields) = data else {
            return Err(Error::InvalidInput(format!(
                "document {doc_id} must be a JSON object"
            )));
        };

        let mut current = match self.read_document(doc_id).await? {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        current.extend(fields);
        Ok(Value::Object(current))
    }

    /// All documents ordered by `(updated_at, id)`.
    async fn scan(&self) -> Result<Vec<(DocumentCursor, RemoteDocument)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(doc_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // renamed away between listing and reading
                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            let data: Value = match serde_json::from_slice(&bytes) {
                Ok(data) => data,
                Err(error) => {
                    tracing::warn!(doc_id, "Skipping unreadable remote document: {error}");
                    continue;
                }
            };
            let Some(updated_at) = document_updated_at(&data) else {
                tracing::warn!(doc_id, "Skipping remote document without updated_at");
                continue;
            };

            documents.push((
                DocumentCursor {
                    updated_at,
                    doc_id: doc_id.to_string(),
                },
                RemoteDocument {
                    id: doc_id.to_string(),
                    data,
                },
            ));
        }

        documents.sort_by(|(left, _), (right, _)| left.cmp(right));
        Ok(documents)
    }
}

fn document_updated_at(data: &Value) -> Option<DateTime<Utc>> {
    let raw = data.get("updated_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

fn after_bounds(
    cursor: &DocumentCursor,
    after: Option<DateTime<Utc>>,
    start_after: Option<&DocumentCursor>,
) -> bool {
    after.map_or(true, |after| cursor.updated_at > after)
        && start_after.map_or(true, |start| cursor > start)
}

#[async_trait]
impl RemoteDocumentStore for FolderDocumentStore {
    fn new_document_id(&self) -> String {
        Uuid::now_v7().to_string()
    }

    async fn get(&self, doc_id: &str) -> Result<Option<RemoteDocument>> {
        Ok(self.read_document(doc_id).await?.map(|data| RemoteDocument {
            id: doc_id.to_string(),
            data,
        }))
    }

    async fn set_merge(&self, doc_id: &str, data: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let merged = self.merged(doc_id, data).await?;
        write_atomically(&self.document_path(doc_id)?, &serde_json::to_vec(&merged)?).await
    }

    async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut prepared = Vec::with_capacity(writes.len());
        for write in writes {
            let merged = self.merged(&write.doc_id, write.data).await?;
            prepared.push((self.document_path(&write.doc_id)?, serde_json::to_vec(&merged)?));
        }
        for (path, bytes) in prepared {
            write_atomically(&path, &bytes).await?;
        }
        Ok(())
    }

    async fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<RemoteDocument>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(cursor, _)| after_bounds(cursor, query.after, query.start_after.as_ref()))
            .take(query.limit)
            .map(|(_, document)| document)
            .collect())
    }

    async fn subscribe(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Result<mpsc::Receiver<Vec<RemoteChange>>> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let feed = Self::new(self.dir.clone(), self.poll_interval);

        tokio::spawn(async move {
            let mut last_seen: Option<DocumentCursor> = None;
            let mut known = HashSet::new();
            let mut ticker = tokio::time::interval(feed.poll_interval);

            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let documents = match feed.scan().await {
                    Ok(documents) => documents,
                    Err(error) => {
                        tracing::warn!("Folder change feed scan failed: {error}");
                        continue;
                    }
                };

                let batch = documents
                    .into_iter()
                    .filter(|(cursor, _)| after_bounds(cursor, after, last_seen.as_ref()))
                    .collect::<Vec<_>>();
                if batch.is_empty() {
                    continue;
                }

                last_seen = batch.last().map(|(cursor, _)| cursor.clone());
                let changes = batch
                    .into_iter()
                    .map(|(_, document)| RemoteChange {
                        kind: if known.insert(document.id.clone()) {
                            ChangeKind::Added
                        } else {
                            ChangeKind::Modified
                        },
                        document,
                    })
                    .collect();

                if tx.send(changes).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Folder change feed stopped");
        });

        Ok(rx)
    }
}
