//! Persistent CLI profile configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use notesync_core::util::normalize_text_option;
use notesync_core::SyncConfig;
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "cli-config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    #[default]
    Folder,
    /// Cloudflare R2, credentials from `R2_*` environment variables
    R2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub remote_dir: Option<PathBuf>,
    #[serde(default)]
    pub blob_backend: BlobBackend,
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
    #[serde(default = "default_can_push")]
    pub can_push: bool,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub sync_config: Option<PathBuf>,
}

impl Default for CliProfile {
    fn default() -> Self {
        Self {
            user_id: None,
            remote_dir: None,
            blob_backend: BlobBackend::Folder,
            blob_dir: None,
            can_push: true,
            restricted: false,
            sync_config: None,
        }
    }
}

const fn default_config_version() -> u32 {
    1
}

const fn default_can_push() -> bool {
    true
}

pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join("notesync").join(CONFIG_FILE_NAME))
        .ok_or_else(|| "Failed to resolve CLI config directory".to_string())
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path()?;
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        if let Some(profile) = normalize_profile_name(explicit) {
            return profile;
        }
        if let Some(profile) =
            normalize_profile_name(std::env::var("NOTESYNC_PROFILE").ok().as_deref())
        {
            return profile;
        }
        if let Some(profile) = normalize_profile_name(self.active_profile.as_deref()) {
            return profile;
        }
        "default".to_string()
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    fn normalize(&mut self) {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.normalize();
        }
    }
}

impl CliProfile {
    pub fn user_id(&self) -> Option<String> {
        normalize_text_option(self.user_id.clone())
    }

    /// Blob directory of the folder backend.
    pub fn folder_blob_dir(&self) -> Option<PathBuf> {
        self.blob_dir
            .clone()
            .or_else(|| self.remote_dir.as_ref().map(|dir| dir.join("blobs")))
    }

    /// Tunables from the referenced JSON file, or defaults.
    pub fn load_sync_config(&self) -> Result<SyncConfig, String> {
        let Some(path) = &self.sync_config else {
            return Ok(SyncConfig::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|error| {
            format!("Failed to read sync config at {}: {}", path.display(), error)
        })?;
        SyncConfig::parse_json(&raw).map_err(|error| {
            format!("Invalid sync config at {}: {}", path.display(), error)
        })
    }

    /// Fields still needed before this profile can sync.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.user_id().is_none() {
            missing.push("user_id");
        }
        if self.remote_dir.is_none() {
            missing.push("remote_dir");
        }
        if self.blob_backend == BlobBackend::Folder && self.folder_blob_dir().is_none() {
            missing.push("blob_dir");
        }
        missing
    }

    fn normalize(&mut self) {
        self.user_id = normalize_text_option(self.user_id.clone());
        self.remote_dir = normalize_path_option(self.remote_dir.take());
        self.blob_dir = normalize_path_option(self.blob_dir.take());
        self.sync_config = normalize_path_option(self.sync_config.take());
    }
}

fn normalize_path_option(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|path| !path.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_profile_name_rejects_empty() {
        assert_eq!(normalize_profile_name(None), None);
        assert_eq!(normalize_profile_name(Some(" ")), None);
    }

    #[test]
    fn config_roundtrip_preserves_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);

        let mut config = CliProfilesConfig {
            version: 1,
            active_profile: Some("default".to_string()),
            profiles: BTreeMap::new(),
        };
        config.profiles.insert(
            "default".to_string(),
            CliProfile {
                user_id: Some(" alice ".to_string()),
                remote_dir: Some(PathBuf::from("/srv/notes")),
                blob_backend: BlobBackend::R2,
                can_push: false,
                ..CliProfile::default()
            },
        );

        config.save_to_path(&path).unwrap();
        let loaded = CliProfilesConfig::load_from_path(&path).unwrap();
        let profile = loaded.profiles.get("default").unwrap();
        assert_eq!(profile.user_id.as_deref(), Some("alice"));
        assert_eq!(profile.blob_backend, BlobBackend::R2);
        assert!(!profile.can_push);
        assert_eq!(profile.folder_blob_dir(), Some(PathBuf::from("/srv/notes/blobs")));
    }

    #[test]
    fn missing_can_push_defaults_to_true() {
        let profile: CliProfile = serde_json::from_str(r#"{"user_id":"bob"}"#).unwrap();
        assert!(profile.can_push);
        assert_eq!(profile.missing_fields(), vec!["remote_dir", "blob_dir"]);
    }

    #[test]
    fn resolve_profile_name_prefers_explicit_then_active() {
        let config = CliProfilesConfig {
            version: 1,
            active_profile: Some("work".to_string()),
            profiles: BTreeMap::new(),
        };
        assert_eq!(config.resolve_profile_name(Some("laptop")), "laptop");
        if std::env::var_os("NOTESYNC_PROFILE").is_none() {
            assert_eq!(config.resolve_profile_name(None), "work");
        }
    }

    #[test]
    fn sync_config_file_is_validated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.json");
        std::fs::write(&path, r#"{"page_size": 50}"#).unwrap();
        let profile = CliProfile {
            sync_config: Some(path.clone()),
            ..CliProfile::default()
        };
        assert_eq!(profile.load_sync_config().unwrap().page_size, 50);

        std::fs::write(&path, r#"{"page_sise": 50}"#).unwrap();
        assert!(profile.load_sync_config().is_err());
    }
}
