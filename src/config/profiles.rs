use crate::error::{AppError, AppResult};
use crate::vault::CredentialVault;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::default_port;

/// Number of recent connections kept on disk
pub const MAX_PROFILES: usize = 10;

/// Saved connection descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub host: String,
    pub user: String,
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_secret: Option<String>,
}

impl ConnectionProfile {
    pub fn new(host: impl Into<String>, user: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port,
            encrypted_secret: None,
        }
    }

    /// Identity key: two profiles with the same key describe the same server
    pub fn identity(&self) -> (&str, &str, u16) {
        (&self.host, &self.user, self.port)
    }

    pub fn same_target(&self, other: &ConnectionProfile) -> bool {
        self.identity() == other.identity()
    }

    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Parse a port field as typed by a user: empty means the default port.
pub fn parse_port(input: &str, default: u16) -> AppResult<u16> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(default);
    }
    match input.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(AppError::InvalidInput(
            "port must be a number between 1 and 65535".to_string(),
        )),
    }
}

/// Older files stored the port as a string; accept both.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortField {
        Number(u16),
        Text(String),
    }

    match PortField::deserialize(deserializer)? {
        PortField::Number(0) => Err(serde::de::Error::custom("port must be non-zero")),
        PortField::Number(port) => Ok(port),
        PortField::Text(text) => {
            parse_port(&text, default_port()).map_err(serde::de::Error::custom)
        }
    }
}

/// Most-recent-first list of saved connections, persisted as JSON
pub struct ProfileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read saved profiles. A missing or damaged file yields an empty list.
    pub fn load(&self) -> Vec<ConnectionProfile> {
        match self.try_load() {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!("Ignoring saved profiles at {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    /// Strict variant of [`ProfileStore::load`] that reports corruption.
    pub fn try_load(&self) -> AppResult<Vec<ConnectionProfile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut profiles: Vec<ConnectionProfile> = serde_json::from_str(&content)
            .map_err(|e| AppError::StoreCorrupt(e.to_string()))?;
        profiles.truncate(MAX_PROFILES);
        Ok(profiles)
    }

    /// Insert `profile` at the front, replacing any entry with the same identity.
    ///
    /// When `secret` is given it is sealed by `vault` and stored with the profile.
    /// Returns the list as persisted.
    pub fn upsert(
        &self,
        mut profile: ConnectionProfile,
        secret: Option<&str>,
        vault: &CredentialVault,
    ) -> AppResult<Vec<ConnectionProfile>> {
        if let Some(secret) = secret {
            profile.encrypted_secret = Some(vault.encrypt(secret)?);
        }

        let _guard = self.write_lock.lock();
        let mut profiles = self.load();
        profiles.retain(|p| !p.same_target(&profile));
        profiles.insert(0, profile);
        profiles.truncate(MAX_PROFILES);

        self.persist(&profiles)?;
        tracing::debug!("Saved {} connection profiles to {:?}", profiles.len(), self.path);
        Ok(profiles)
    }

    /// Decrypt the stored secret of `profile`, if there is one that still opens.
    pub fn resolve_secret(profile: &ConnectionProfile, vault: &CredentialVault) -> Option<String> {
        let blob = profile.encrypted_secret.as_deref()?;
        match vault.decrypt(blob) {
            Ok(secret) => Some(secret),
            Err(e) => {
                tracing::warn!("Stored secret for {} unavailable: {}", profile.label(), e);
                None
            }
        }
    }

    // Write atomically using temp file
    fn persist(&self, profiles: &[ConnectionProfile]) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(profiles)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}
