use crate::config::{AppSettings, ConnectionProfile, ProfileStore};
use crate::controller::{self, ControllerHandle, Presenter};
use crate::error::AppResult;
use crate::ssh::{Connector, SshConnector};
use crate::vault::CredentialVault;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Process-wide state shared by every tab
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: AppSettings,
    pub vault: Arc<CredentialVault>,
    pub profiles: Arc<ProfileStore>,
    pub connector: Arc<dyn Connector>,
}

impl AppState {
    pub fn new(config_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(config_dir)?;

        // Load settings
        let settings = AppSettings::load(config_dir)?;
        let storage = &settings.storage;

        let vault = CredentialVault::open(&storage.key_path(config_dir))?;
        let profiles = ProfileStore::new(storage.profiles_path(config_dir));
        let connector = SshConnector::new(&settings, storage.known_hosts_path(config_dir));

        tracing::info!("Using config dir {:?}", config_dir);
        Ok(Self::from_parts(
            config_dir.to_path_buf(),
            settings,
            vault,
            profiles,
            Arc::new(connector),
        ))
    }

    pub fn from_parts(
        config_dir: PathBuf,
        settings: AppSettings,
        vault: CredentialVault,
        profiles: ProfileStore,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config_dir,
            settings,
            vault: Arc::new(vault),
            profiles: Arc::new(profiles),
            connector,
        }
    }

    /// Saved connections, most recent first
    pub fn saved_profiles(&self) -> Vec<ConnectionProfile> {
        self.profiles.load()
    }

    /// Start a new tab with its own controller task
    pub fn open_tab(self: &Arc<Self>, presenter: Arc<dyn Presenter>) -> (ControllerHandle, JoinHandle<()>) {
        controller::spawn(Arc::clone(self), presenter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_creates_key_and_settings() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("tabshell");
        let state = AppState::new(&config_dir).unwrap();

        assert!(config_dir.join("config.toml").exists());
        assert!(config_dir.join(".vault.key").exists());
        assert!(state.saved_profiles().is_empty());
    }

    #[test]
    fn test_secrets_survive_restart() {
        let dir = TempDir::new().unwrap();
        let first = AppState::new(dir.path()).unwrap();
        first
            .profiles
            .upsert(ConnectionProfile::new("h", "u", 22), Some("pw"), &first.vault)
            .unwrap();
        drop(first);

        let second = AppState::new(dir.path()).unwrap();
        let saved = second.saved_profiles();
        assert_eq!(
            ProfileStore::resolve_secret(&saved[0], &second.vault).as_deref(),
            Some("pw")
        );
    }

    #[test]
    fn test_empty_key_file_does_not_block_startup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".vault.key"), b"").unwrap();

        let state = AppState::new(dir.path()).unwrap();
        let blob = state.vault.encrypt("pw").unwrap();
        assert_eq!(state.vault.decrypt(&blob).unwrap(), "pw");
        assert_eq!(std::fs::read(dir.path().join(".vault.key")).unwrap().len(), 32);
    }
}
