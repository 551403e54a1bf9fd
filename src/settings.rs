use std::path::{Path, PathBuf};

use ac_accounts::inventory::DEFAULT_BASE_URL;
use ac_auth::config::{CLIENT_ID, REDIRECT_PORT};
use ac_auth::{AuthConfig, StorageMode, VaultConfig};
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Contents of `config.toml`; every field is optional
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,
    pub redirect_port: u16,
    pub storage: StorageMode,
    pub inventory_base_url: String,
    pub accounts_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            redirect_port: REDIRECT_PORT,
            storage: StorageMode::default(),
            inventory_base_url: DEFAULT_BASE_URL.to_string(),
            accounts_file: None,
        }
    }
}

impl Settings {
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("dev", "authchain", "authchain-mc")
            .context("Failed to get project directories")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Read settings from `path`, falling back to defaults if it doesn't exist
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::metadata(path).await.is_err() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.client_id.clone(),
            redirect_port: self.redirect_port,
            ..AuthConfig::default()
        }
    }

    pub fn vault_config(&self) -> anyhow::Result<VaultConfig> {
        VaultConfig::default_paths(self.storage).context("Failed to resolve secret storage paths")
    }

    pub fn accounts_path(&self) -> anyhow::Result<PathBuf> {
        match &self.accounts_file {
            Some(path) => Ok(path.clone()),
            None => Ok(ac_accounts::AccountStore::default_path()?),
        }
    }
}
