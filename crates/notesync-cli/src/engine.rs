//! Wiring of the core sync engine from a CLI profile.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notesync_core::ports::{EntitlementProvider, RemoteBlobStore, Session, SessionProvider};
use notesync_core::services::DatabaseService;
use notesync_core::storage::{
    sanitize_token, FolderBlobStore, FolderDocumentStore, LocalFileSystem, R2Config, R2Storage,
};
use notesync_core::sync::{SyncCoordinator, SyncDeps};
use notesync_core::SyncConfig;

use crate::config_profiles::{BlobBackend, CliProfile, CliProfilesConfig};
use crate::crypto::PassphraseEncryption;
use crate::error::CliError;

const PASSPHRASE_ENV: &str = "NOTESYNC_PASSPHRASE";

/// Account behind a CLI profile. A profile is always signed in.
struct ProfileSession(Session);

impl SessionProvider for ProfileSession {
    fn current_session(&self) -> Option<Session> {
        Some(self.0.clone())
    }
}

/// Push permission configured on the profile.
struct ProfileEntitlement(bool);

impl EntitlementProvider for ProfileEntitlement {
    fn is_paid(&self) -> bool {
        self.0
    }
}

/// Blob backend selected by the profile.
pub enum BlobTarget {
    Folder(PathBuf),
    R2(R2Storage),
}

impl BlobTarget {
    fn from_profile(profile: &CliProfile) -> Result<Self, CliError> {
        match profile.blob_backend {
            BlobBackend::Folder => profile
                .folder_blob_dir()
                .map(Self::Folder)
                .ok_or(CliError::SyncNotConfigured),
            BlobBackend::R2 => {
                let config = R2Config::from_env()?.ok_or_else(|| {
                    CliError::Config(
                        "R2 blob backend selected but R2_ACCOUNT_ID, R2_BUCKET, \
                         R2_ACCESS_KEY_ID and R2_SECRET_ACCESS_KEY are not set"
                            .to_string(),
                    )
                })?;
                Ok(Self::R2(R2Storage::new(config)))
            }
        }
    }

    fn store(&self) -> Arc<dyn RemoteBlobStore> {
        match self {
            Self::Folder(dir) => Arc::new(FolderBlobStore::new(dir.clone())),
            Self::R2(storage) => Arc::new(storage.clone()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Folder(dir) => format!("folder {}", dir.display()),
            Self::R2(storage) => format!("r2 bucket {}", storage.config().bucket),
        }
    }

    /// Check that the backend can be reached with the current settings.
    pub async fn check(&self) -> Result<(), CliError> {
        match self {
            Self::Folder(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(())
            }
            Self::R2(storage) => Ok(storage.bucket_is_reachable().await?),
        }
    }
}

/// Everything a sync command needs.
pub struct SyncContext {
    pub db: Arc<DatabaseService>,
    pub coordinator: SyncCoordinator,
    pub config: SyncConfig,
    pub blobs: BlobTarget,
    pub profile_name: String,
}

/// Local attachment and cache directory next to the database file.
pub fn local_documents_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map_or_else(|| PathBuf::from("documents"), |dir| dir.join("documents"))
}

/// Open the database and wire a coordinator from the active profile.
pub async fn open_sync_context(
    db_path: &Path,
    explicit_profile: Option<&str>,
) -> Result<SyncContext, CliError> {
    let profiles = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = profiles.resolve_profile_name(explicit_profile);
    let profile = profiles
        .profile(&profile_name)
        .cloned()
        .ok_or(CliError::SyncNotConfigured)?;

    let passphrase = std::env::var(PASSPHRASE_ENV).ok();
    if passphrase.as_deref().is_none_or(str::is_empty) {
        tracing::warn!("{PASSPHRASE_ENV} is not set; notes cannot be synced until it is");
    }

    let db = Arc::new(DatabaseService::open_path(db_path).await?);
    build_sync_context(db, db_path, &profile_name, &profile, passphrase.as_deref())
}

/// Wire a coordinator for `profile` over an already opened database.
pub fn build_sync_context(
    db: Arc<DatabaseService>,
    db_path: &Path,
    profile_name: &str,
    profile: &CliProfile,
    passphrase: Option<&str>,
) -> Result<SyncContext, CliError> {
    let missing = profile.missing_fields();
    if !missing.is_empty() {
        tracing::debug!(
            "Profile '{}' is missing: {}",
            profile_name,
            missing.join(", ")
        );
        return Err(CliError::SyncNotConfigured);
    }
    let (Some(user_id), Some(remote_dir)) = (profile.user_id(), profile.remote_dir.clone()) else {
        return Err(CliError::SyncNotConfigured);
    };

    let config = profile.load_sync_config().map_err(CliError::Config)?;
    let blobs = BlobTarget::from_profile(profile)?;
    let documents = FolderDocumentStore::new(
        remote_dir.join("documents").join(sanitize_token(&user_id)),
        config.listener_poll(),
    );
    let encryption = PassphraseEncryption::new(passphrase, &user_id)?;

    let deps = SyncDeps {
        notes: db.clone(),
        ledger: db.clone(),
        file_tracks: db.clone(),
        encryption: Arc::new(encryption),
        entitlement: Arc::new(ProfileEntitlement(profile.can_push)),
        session: Arc::new(ProfileSession(Session {
            user_id,
            restricted: profile.restricted,
        })),
        documents: Arc::new(documents),
        blobs: blobs.store(),
        fs: Arc::new(LocalFileSystem::new(local_documents_dir(db_path))),
    };

    tracing::info!("Sync enabled via profile '{}'", profile_name);
    Ok(SyncContext {
        db,
        coordinator: SyncCoordinator::new(deps, config.clone()),
        config,
        blobs,
        profile_name: profile_name.to_string(),
    })
}
