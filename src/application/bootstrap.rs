use crate::infrastructure::config::{ExtensionConfig, ensure_default_config, load_config};
use crate::infrastructure::credential_store::KeyringCredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{SqliteSettingsStore, initialize_database};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub config: ExtensionConfig,
}

impl BootstrapResult {
    pub fn settings_store(&self) -> SqliteSettingsStore {
        SqliteSettingsStore::new(&self.database_path)
    }

    /// API credentials live in the OS keyring, outside the workspace.
    pub fn credential_store(&self) -> KeyringCredentialStore {
        KeyringCredentialStore::default()
    }
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("ghostcal.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_config(&config_dir)?;
    let config = load_config(&config_dir)?;
    initialize_database(&database_path)?;
    info!(root = %workspace_root.display(), "workspace ready");

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        database_path,
        config,
    })
}
