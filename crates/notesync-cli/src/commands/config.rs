use std::path::{Path, PathBuf};

use notesync_core::util::normalize_text_option;

use crate::cli::{BlobBackendArg, ConfigCommands};
use crate::config_profiles::{BlobBackend, CliProfile, CliProfilesConfig};
use crate::error::CliError;

/// Fields given to `config init`; `None` keeps the stored value.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub user_id: Option<String>,
    pub remote_dir: Option<PathBuf>,
    pub blob_backend: Option<BlobBackendArg>,
    pub blob_dir: Option<PathBuf>,
    pub can_push: Option<bool>,
    pub restricted: Option<bool>,
    pub sync_config: Option<PathBuf>,
}

impl From<BlobBackendArg> for BlobBackend {
    fn from(value: BlobBackendArg) -> Self {
        match value {
            BlobBackendArg::Folder => Self::Folder,
            BlobBackendArg::R2 => Self::R2,
        }
    }
}

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            profile,
            user_id,
            remote_dir,
            blob_backend,
            blob_dir,
            can_push,
            restricted,
            sync_config,
            no_activate,
        } => {
            let update = ProfileUpdate {
                user_id,
                remote_dir,
                blob_backend,
                blob_dir,
                can_push,
                restricted,
                sync_config,
            };
            run_config_init(profile.as_deref().or(global_profile), update, no_activate)
        }
    }
}

pub fn run_config_init(
    profile_name: Option<&str>,
    update: ProfileUpdate,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);

    let profile = config.profile_mut_or_default(&profile_name);
    apply_profile_update(profile, update)?;
    let missing_fields = profile.missing_fields();

    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save().map_err(CliError::Config)?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    if missing_fields.is_empty() {
        println!("Sync profile '{profile_name}' is ready. Run `notesync sync`.");
    } else {
        println!(
            "Profile '{}' is missing: {}",
            profile_name,
            missing_fields.join(", ")
        );
    }

    Ok(())
}

/// Merge explicit values into `profile` and validate the result.
pub fn apply_profile_update(profile: &mut CliProfile, update: ProfileUpdate) -> Result<(), CliError> {
    if let Some(user_id) = update.user_id {
        profile.user_id = Some(
            normalize_text_option(Some(user_id))
                .ok_or_else(|| CliError::Config("user_id must not be empty".to_string()))?,
        );
    }
    if let Some(remote_dir) = update.remote_dir {
        profile.remote_dir = Some(absolute_path(&remote_dir)?);
    }
    if let Some(blob_backend) = update.blob_backend {
        profile.blob_backend = blob_backend.into();
    }
    if let Some(blob_dir) = update.blob_dir {
        profile.blob_dir = Some(absolute_path(&blob_dir)?);
    }
    if let Some(can_push) = update.can_push {
        profile.can_push = can_push;
    }
    if let Some(restricted) = update.restricted {
        profile.restricted = restricted;
    }
    if let Some(sync_config) = update.sync_config {
        profile.sync_config = Some(absolute_path(&sync_config)?);
    }

    profile.load_sync_config().map_err(CliError::Config)?;
    Ok(())
}

fn absolute_path(path: &Path) -> Result<PathBuf, CliError> {
    if path.as_os_str().is_empty() {
        return Err(CliError::Config("path must not be empty".to_string()));
    }
    Ok(std::path::absolute(path)?)
}
