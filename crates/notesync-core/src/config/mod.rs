//! Sync engine configuration.
//!
//! `SyncConfig` is loaded from a JSON file referenced by the CLI profile or
//! built with defaults. Unknown fields are rejected so typos surface early.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SYNC_CONFIG_SCHEMA_VERSION: u32 = 1;

/// Tunables of the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub schema_version: u32,
    /// Delay collapsing rapid local edits into one push
    pub debounce_ms: u64,
    /// Remote documents per cache page
    pub page_size: usize,
    /// Writes per batched remote commit
    pub batch_write_limit: usize,
    pub upload_timeout_secs: u64,
    /// Timeout of document reads/writes and blob metadata calls
    pub metadata_timeout_secs: u64,
    pub cache_io_timeout_secs: u64,
    /// Age after which cached remote documents are re-validated
    pub stale_cache_secs: u64,
    /// Concurrent attachment transfers within one note
    pub attachment_fan_out: usize,
    /// Period of the scheduler's timer trigger
    pub poll_interval_secs: u64,
    /// Polling cadence of folder-backed change feeds
    pub listener_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema_version: SYNC_CONFIG_SCHEMA_VERSION,
            debounce_ms: 5_000,
            page_size: 20,
            batch_write_limit: 400,
            upload_timeout_secs: 120,
            metadata_timeout_secs: 30,
            cache_io_timeout_secs: 5,
            stale_cache_secs: 300,
            attachment_fan_out: 4,
            poll_interval_secs: 60,
            listener_poll_ms: 1_000,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration payload.
    pub fn parse_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::InvalidInput(format!("invalid sync config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the schema version and that every size and duration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SYNC_CONFIG_SCHEMA_VERSION {
            return Err(Error::InvalidInput(format!(
                "unsupported sync config schema_version {} (expected {})",
                self.schema_version, SYNC_CONFIG_SCHEMA_VERSION
            )));
        }

        let zero_fields = [
            ("page_size", self.page_size == 0),
            ("batch_write_limit", self.batch_write_limit == 0),
            ("attachment_fan_out", self.attachment_fan_out == 0),
            ("upload_timeout_secs", self.upload_timeout_secs == 0),
            ("metadata_timeout_secs", self.metadata_timeout_secs == 0),
            ("cache_io_timeout_secs", self.cache_io_timeout_secs == 0),
            ("listener_poll_ms", self.listener_poll_ms == 0),
        ];
        if let Some((field, _)) = zero_fields.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::InvalidInput(format!(
                "sync config field '{field}' must be greater than zero"
            )));
        }

        Ok(())
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    #[must_use]
    pub const fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    #[must_use]
    pub const fn cache_io_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_io_timeout_secs)
    }

    #[must_use]
    pub const fn stale_cache_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_cache_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn listener_poll(&self) -> Duration {
        Duration::from_millis(self.listener_poll_ms)
    }
}
