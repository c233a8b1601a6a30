//! Sync coordinator: gates, the busy flag, debouncing and observable state.
//!
//! One pass is `Idle → Pushing → Fetching → Draining → Idle`. Only one pass
//! runs at a time; a pass requested while another one runs is dropped and the
//! running pass picks up the newer state on its next iteration.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::models::LocalId;
use crate::ports::{
    ChangeLedger, EncryptionProvider, EntitlementProvider, FileSystem, FileTrackStore, NoteStore,
    RemoteBlobStore, RemoteDocumentStore, Session, SessionProvider,
};
use crate::state::{SyncEvent, SyncPhase, SyncReport, SyncStatus};

use super::attachments::AttachmentTransferManager;
use super::cache::{PersistentSyncCache, SyncCacheMetadata};
use super::scheduler::SyncTrigger;

/// Sync state key holding the account the local state belongs to.
pub(super) const LAST_USER_KEY: &str = "last_user_id";

const EVENT_CAPACITY: usize = 64;

/// Collaborators of the coordinator.
#[derive(Clone)]
pub struct SyncDeps {
    pub notes: Arc<dyn NoteStore>,
    pub ledger: Arc<dyn ChangeLedger>,
    pub file_tracks: Arc<dyn FileTrackStore>,
    pub encryption: Arc<dyn EncryptionProvider>,
    pub entitlement: Arc<dyn EntitlementProvider>,
    pub session: Arc<dyn SessionProvider>,
    pub documents: Arc<dyn RemoteDocumentStore>,
    pub blobs: Arc<dyn RemoteBlobStore>,
    pub fs: Arc<dyn FileSystem>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum PassKind {
    /// Push, then pull
    Full,
    PushOnly,
}

/// Snapshot of the readiness gates.
#[derive(Clone, Debug)]
pub(super) struct Gates {
    pub session: Option<Session>,
    pub can_receive: bool,
    pub can_push: bool,
}

pub(super) struct Inner {
    pub(super) deps: SyncDeps,
    pub(super) config: SyncConfig,
    pub(super) cache: PersistentSyncCache,
    pub(super) transfers: AttachmentTransferManager,
    busy: AtomicBool,
    disposed: AtomicBool,
    encryption_was_ready: AtomicBool,
    debounce_generation: AtomicU64,
    debounce: Mutex<Option<JoinHandle<()>>>,
    pub(super) listener: Mutex<Option<JoinHandle<()>>>,
    in_flight_notes: Mutex<HashSet<LocalId>>,
    in_flight_docs: Mutex<HashSet<String>>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
}

/// Orchestrates push, pull and the live change feed for one account.
#[derive(Clone)]
pub struct SyncCoordinator {
    pub(super) inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(deps: SyncDeps, config: SyncConfig) -> Self {
        let cache = PersistentSyncCache::new(Arc::clone(&deps.fs), config.cache_io_timeout());
        let transfers = AttachmentTransferManager::new(
            Arc::clone(&deps.blobs),
            Arc::clone(&deps.fs),
            Arc::clone(&deps.file_tracks),
            Arc::clone(&deps.encryption),
            &config,
        );
        let encryption_ready = deps.encryption.is_ready();
        let (status, _) = watch::channel(SyncStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                cache,
                transfers,
                busy: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                encryption_was_ready: AtomicBool::new(encryption_ready),
                debounce_generation: AtomicU64::new(0),
                debounce: Mutex::new(None),
                listener: Mutex::new(None),
                in_flight_notes: Mutex::new(HashSet::new()),
                in_flight_docs: Mutex::new(HashSet::new()),
                status,
                events,
            }),
        }
    }

    /// Load persisted state and start the live feed when receiving is allowed.
    pub async fn start(&self) -> Result<()> {
        self.inner.cache.load().await?;
        let watermark = self.inner.cache.watermark().await?;
        self.inner.publish(|status| status.last_synced_at = watermark);
        self.inner.start_realtime_listener().await
    }

    /// Run a push pass now, or collapse it into the debounced one.
    pub async fn sync(&self, immediate: bool) -> SyncReport {
        if immediate {
            self.inner.run_pass(PassKind::PushOnly).await
        } else {
            self.schedule_debounced_sync();
            SyncReport::skipped()
        }
    }

    /// Restart the debounce timer; the push runs once edits stop arriving.
    pub fn schedule_debounced_sync(&self) {
        self.inner.schedule_debounced_sync();
    }

    /// Push (when allowed) then pull. Never fails; outcomes land in the
    /// report and the published status.
    pub async fn refresh(&self) -> SyncReport {
        self.inner.run_pass(PassKind::Full).await
    }

    pub async fn start_realtime_listener(&self) -> Result<()> {
        self.inner.start_realtime_listener().await
    }

    pub fn stop_realtime_listener(&self) {
        self.inner.stop_realtime_listener();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }

    /// React to an external trigger.
    pub async fn handle_trigger(&self, trigger: SyncTrigger) {
        debug!("Sync trigger: {trigger:?}");
        match trigger {
            SyncTrigger::Timer | SyncTrigger::Manual | SyncTrigger::EntitlementChanged => {
                self.refresh().await;
            }
            SyncTrigger::LocalEdit => self.schedule_debounced_sync(),
            SyncTrigger::Login | SyncTrigger::EncryptionReadyChanged => {
                self.inner.check_encryption_transition().await;
                if let Err(error) = self.inner.start_realtime_listener().await {
                    warn!("Could not start change listener: {error}");
                }
                self.refresh().await;
            }
            SyncTrigger::Logout => {
                self.inner.stop_realtime_listener();
                self.inner.cancel_debounce();
                self.inner.publish(|status| status.online = false);
            }
            SyncTrigger::Shutdown => self.dispose(),
        }
    }

    /// Forget the pull cache and watermark; the next pull fetches everything.
    pub async fn reset(&self) -> Result<()> {
        self.inner.cache.clear().await?;
        self.inner.publish(|status| status.last_synced_at = None);
        self.inner.emit(SyncEvent::Reset);
        Ok(())
    }

    /// Stop timers and the live feed. Passes already running finish.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel_debounce();
        self.inner.stop_realtime_listener();
        info!("Sync coordinator disposed");
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub async fn cache_metadata(&self) -> Result<SyncCacheMetadata> {
        self.inner.cache.metadata().await
    }
}

/// Clears the busy flag when the pass ends, including on panic.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Marks a note or remote document as being worked on.
pub(super) struct Claim<'a> {
    inner: &'a Inner,
    key: ClaimKey,
}

enum ClaimKey {
    Note(LocalId),
    Doc(String),
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        match &self.key {
            ClaimKey::Note(id) => {
                lock(&self.inner.in_flight_notes).remove(id);
                let id = *id;
                self.inner.publish(|status| {
                    status.in_flight.remove(&id);
                });
            }
            ClaimKey::Doc(doc_id) => {
                lock(&self.inner.in_flight_docs).remove(doc_id);
            }
        }
    }
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    pub(super) fn gates(&self) -> Gates {
        let encryption_ready = self.deps.encryption.is_ready();
        let session = self.deps.session.current_session();
        let can_receive =
            encryption_ready && session.as_ref().is_some_and(|session| !session.restricted);
        let can_push = can_receive && self.deps.entitlement.is_paid();
        Gates {
            session,
            can_receive,
            can_push,
        }
    }

    pub(super) async fn run_pass(self: &Arc<Self>, kind: PassKind) -> SyncReport {
        // let state captured by the caller settle before reading the flag
        tokio::task::yield_now().await;
        if self.disposed.load(Ordering::Acquire) {
            return SyncReport::skipped();
        }
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            debug!("Sync already running, dropping trigger");
            return SyncReport::skipped();
        };

        let gates = self.gates();
        self.publish(|status| status.online = gates.can_receive);
        let Some(session) = gates.session.clone().filter(|_| gates.can_receive) else {
            debug!("Sync gates closed, skipping pass");
            return SyncReport::skipped();
        };

        if let Err(error) = self.check_account(&session).await {
            warn!("Could not verify sync account: {error}");
        }
        self.check_encryption_transition().await;

        let mut report = SyncReport::default();
        if gates.can_push {
            self.push(&session, &mut report).await;
        }
        if kind == PassKind::Full {
            self.pull(&mut report).await;
        }

        self.finish(&report).await;
        report
    }

    async fn finish(&self, report: &SyncReport) {
        let watermark = self.cache.watermark().await.ok().flatten();
        self.publish(|status| {
            status.phase = SyncPhase::Idle;
            status.synced_count = 0;
            status.total_count = 0;
            status.last_synced_at = watermark.or(status.last_synced_at);
            status.message = match status.failed.len() {
                0 => None,
                1 => Some("1 note failed to sync".to_string()),
                count => Some(format!("{count} notes failed to sync")),
            };
        });
        self.emit(SyncEvent::PhaseChanged(SyncPhase::Idle));
        self.emit(SyncEvent::Finished(report.clone()));

        info!(
            "Sync pass finished: {} pushed, {} applied, {} deleted, {} deferred, {} failed",
            report.pushed,
            report.applied,
            report.deleted,
            report.deferred,
            report.failed.len()
        );
    }

    /// Reset local sync state when a different account signs in.
    pub(super) async fn check_account(&self, session: &Session) -> Result<()> {
        let previous = self.deps.ledger.load_state(LAST_USER_KEY).await?;
        if previous.as_deref() == Some(session.user_id.as_str()) {
            return Ok(());
        }

        if previous.is_some() {
            info!("Signed in with a different account, resetting sync state");
            self.cache.clear().await?;
            self.publish(|status| {
                status.failed.clear();
                status.last_synced_at = None;
            });
            self.emit(SyncEvent::Reset);
        }
        self.deps
            .ledger
            .save_state(LAST_USER_KEY, Some(&session.user_id))
            .await
    }

    /// On a false → true flip of encryption readiness, forget the watermark so
    /// documents skipped while undecryptable are fetched again.
    pub(super) async fn check_encryption_transition(self: &Arc<Self>) {
        let ready = self.deps.encryption.is_ready();
        let was_ready = self.encryption_was_ready.swap(ready, Ordering::AcqRel);
        if !ready || was_ready {
            return;
        }

        info!("Encryption became ready, pulling everything again");
        if let Err(error) = self.cache.clear().await {
            warn!("Could not clear sync cache: {error}");
        }
        self.publish(|status| status.last_synced_at = None);
        self.emit(SyncEvent::Reset);

        if self.is_listening() {
            self.stop_realtime_listener();
            if let Err(error) = self.start_realtime_listener().await {
                warn!("Could not restart change listener: {error}");
            }
        }
    }

    pub(super) fn schedule_debounced_sync(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let generation = self.debounce_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::clone(self);
        let delay = self.config.debounce();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.debounce_generation.load(Ordering::Acquire) == generation {
                inner.run_pass(PassKind::PushOnly).await;
            }
        });

        // a superseded timer that already started its pass is left to finish
        if let Some(previous) = lock(&self.debounce).replace(handle) {
            if !previous.is_finished() {
                debug!("Debounced sync rescheduled");
            }
        }
    }

    fn cancel_debounce(&self) {
        self.debounce_generation.fetch_add(1, Ordering::AcqRel);
        lock(&self.debounce).take();
    }

    pub(super) fn claim_note(&self, local_id: LocalId) -> Option<Claim<'_>> {
        if !lock(&self.in_flight_notes).insert(local_id) {
            return None;
        }
        self.publish(|status| {
            status.in_flight.insert(local_id);
        });
        Some(Claim {
            inner: self,
            key: ClaimKey::Note(local_id),
        })
    }

    pub(super) fn claim_doc(&self, doc_id: &str) -> Option<Claim<'_>> {
        if !lock(&self.in_flight_docs).insert(doc_id.to_string()) {
            return None;
        }
        Some(Claim {
            inner: self,
            key: ClaimKey::Doc(doc_id.to_string()),
        })
    }

    pub(super) fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(update);
    }

    pub(super) fn set_phase(&self, phase: SyncPhase, message: &str, total: usize) {
        self.publish(|status| {
            status.phase = phase;
            status.message = Some(message.to_string());
            status.synced_count = 0;
            status.total_count = total;
        });
        self.emit(SyncEvent::PhaseChanged(phase));
    }

    pub(super) fn advance_progress(&self) {
        self.publish(|status| status.synced_count += 1);
    }

    pub(super) fn note_succeeded(&self, local_id: LocalId) {
        self.publish(|status| {
            status.failed.remove(&local_id);
        });
    }

    pub(super) fn note_failed(&self, report: &mut SyncReport, local_id: LocalId, error: String) {
        warn!("Sync of note {local_id} failed: {error}");
        report.failed.insert(local_id);
        self.publish(|status| {
            status.failed.insert(local_id);
        });
        self.emit(SyncEvent::NoteFailed { local_id, error });
    }

    pub(super) fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
