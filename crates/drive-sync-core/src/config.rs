//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings consumed by the sync engine.
///
/// Stored as JSON with camelCase keys; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Seconds between reconciliation passes
    pub poll_interval_secs: u64,
    /// Pull binary files unconditionally when they become active
    pub auto_refresh_binary: bool,
    /// Quiet period before coalesced edits are pushed
    pub debounce_millis: u64,
    /// How far the remote timestamp may lead the local stamp before a pull
    pub stale_tolerance_millis: u64,
    /// Name of the top-level remote container holding all vaults
    pub root_folder: String,
    /// Name of this vault's remote container. Empty until the host fills it
    /// in (the daemon uses the vault directory name).
    pub vault_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            auto_refresh_binary: false,
            debounce_millis: 2250,
            stale_tolerance_millis: 3000,
            root_folder: "obsidian".to_string(),
            vault_name: String::new(),
        }
    }
}

impl SyncConfig {
    /// Load a JSON settings file.
    ///
    /// The result is not validated yet; callers apply their overrides first
    /// and then call `validate`.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.display().to_string(), e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "pollIntervalSecs must be at least 1".into(),
            ));
        }
        if self.vault_name.trim().is_empty() {
            return Err(ConfigError::Invalid("vaultName must not be empty".into()));
        }
        if self.root_folder.trim().is_empty() {
            return Err(ConfigError::Invalid("rootFolder must not be empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    pub fn stale_tolerance(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_tolerance_millis as i64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Read(String, String),

    #[error("Invalid config {0}: {1}")]
    Parse(String, String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
