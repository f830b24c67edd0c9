use crate::error::AppResult;
use crate::ssh::HostKeyPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub terminal: TerminalSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds between keepalives; 0 disables them
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

pub fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keepalive() -> u32 {
    20
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval: default_keepalive(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    #[serde(default = "default_cursor_glyph")]
    pub cursor_glyph: char,
    #[serde(default = "default_true")]
    pub cursor_blink: bool,
    #[serde(default = "default_blink_interval")]
    pub blink_interval_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_buffer")]
    pub read_buffer_bytes: usize,
}

fn default_cursor_glyph() -> char {
    '█'
}

fn default_true() -> bool {
    true
}

fn default_blink_interval() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    10
}

fn default_read_buffer() -> usize {
    4096
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            cursor_glyph: default_cursor_glyph(),
            cursor_blink: true,
            blink_interval_ms: default_blink_interval(),
            poll_interval_ms: default_poll_interval(),
            read_buffer_bytes: default_read_buffer(),
        }
    }
}

impl TerminalSettings {
    pub fn blink_interval(&self) -> Duration {
        Duration::from_millis(self.blink_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// File locations; relative paths and unset fields resolve against the config dir
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<PathBuf>,
}

impl StorageSettings {
    pub fn profiles_path(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.profiles_file.as_deref(), "servers.json")
    }

    pub fn key_path(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.key_file.as_deref(), ".vault.key")
    }

    pub fn known_hosts_path(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.known_hosts_file.as_deref(), "known_hosts")
    }
}

fn resolve(config_dir: &Path, configured: Option<&Path>, default_name: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => config_dir.join(path),
        None => config_dir.join(default_name),
    }
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}
