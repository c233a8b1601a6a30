//! Sync engine: push local changes, pull remote ones through a persistent
//! cache and follow the live change feed.

mod attachments;
mod cache;
mod codec;
mod coordinator;
mod listener;
mod pull;
mod push;
mod resolver;
mod scheduler;

pub use attachments::{AttachmentTransferManager, TransferOutcome};
pub use cache::{
    PendingRemoteSync, PersistentSyncCache, RemoteSyncStatus, SyncCacheMetadata, SyncCachePage,
};
pub use codec::{apply_payload, decode_payload, encode_note};
pub use coordinator::{SyncCoordinator, SyncDeps};
pub use resolver::{conflict_for, resolve, skip_on_initial_sync, Resolution};
pub use scheduler::{SyncScheduler, SyncTrigger};
