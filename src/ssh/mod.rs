pub mod session;

pub use session::*;

use crate::config::AppSettings;
use crate::error::ConnectError;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, Session as Ssh2Session};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How unknown or changed host keys are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept and remember a host the first time it is seen
    #[default]
    FirstUse,
    /// Only connect to hosts already present in known_hosts
    Strict,
}

/// Everything needed to open one remote shell
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub user: String,
    pub secret: String,
    pub port: u16,
    pub timeout: Duration,
}

impl ConnectParams {
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("secret", &"[REDACTED]")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bidirectional byte stream of an interactive shell.
///
/// `read` must not block: it returns `ErrorKind::WouldBlock` (or `Ok(0)`)
/// when nothing is pending.
pub trait ShellTransport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Remote side has closed the channel
    fn is_eof(&self) -> bool;

    fn keepalive(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()>;
}

/// Opens remote sessions; the seam between controllers and the network
pub trait Connector: Send + Sync {
    fn connect(&self, params: &ConnectParams) -> Result<RemoteSession, ConnectError>;
}

/// known_hosts file plus the policy applied to it
pub struct KnownHosts {
    path: PathBuf,
    policy: HostKeyPolicy,
    // Connections from several tabs may add entries at once
    write_lock: Mutex<()>,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>, policy: HostKeyPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify the host key presented during the handshake
    pub fn verify(&self, ssh_session: &Ssh2Session, host: &str, port: u16) -> Result<(), ConnectError> {
        let (key, key_type) = ssh_session
            .host_key()
            .ok_or_else(|| ConnectError::ProtocolError("No host key received".to_string()))?;
        let fingerprint = compute_sha256_fingerprint(key);

        let _guard = self.write_lock.lock();
        let mut known_hosts = ssh_session
            .known_hosts()
            .map_err(|e| ConnectError::from_ssh(&e))?;

        if self.path.exists() {
            if let Err(e) = known_hosts.read_file(&self.path, KnownHostFileKind::OpenSSH) {
                tracing::warn!("Failed to read known_hosts {:?}: {}", self.path, e);
            }
        }

        match known_hosts.check_port(host, port, key) {
            CheckResult::Match => {
                tracing::debug!("Host key matched for {}:{}", host, port);
                Ok(())
            }
            CheckResult::NotFound => match self.policy {
                HostKeyPolicy::Strict => Err(ConnectError::ProtocolError(format!(
                    "Unknown host key for {}:{} ({})",
                    host, port, fingerprint
                ))),
                HostKeyPolicy::FirstUse => {
                    tracing::info!(
                        "Trusting new host key for {}:{} on first use ({})",
                        host,
                        port,
                        fingerprint
                    );

                    // Not being able to remember the key does not block this connection.
                    if let Err(e) = self.remember(&mut known_hosts, host, port, key, key_type) {
                        tracing::warn!(
                            "Failed to remember host key for {}: {}",
                            known_hosts_entry(host, port),
                            e
                        );
                    }
                    Ok(())
                }
            },
            CheckResult::Mismatch => {
                tracing::error!(
                    "HOST KEY MISMATCH for {}:{}! Possible MITM attack!",
                    host,
                    port
                );
                Err(ConnectError::ProtocolError(format!(
                    "Host key for {}:{} has changed ({}); remove the old entry from {:?} if this is expected",
                    host, port, fingerprint, self.path
                )))
            }
            CheckResult::Failure => Err(ConnectError::ProtocolError(
                "Failed to check known hosts".to_string(),
            )),
        }
    }
}

impl KnownHosts {
    /// Add `key` for `host:port` and rewrite the known_hosts file
    fn remember(
        &self,
        known_hosts: &mut ssh2::KnownHosts,
        host: &str,
        port: u16,
        key: &[u8],
        key_type: HostKeyType,
    ) -> Result<(), ssh2::Error> {
        let entry = known_hosts_entry(host, port);
        let comment = format!("Added by tabshell on {}", chrono::Utc::now());
        known_hosts.add(&entry, key, &comment, KnownHostKeyFormat::from(key_type))?;

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        known_hosts.write_file(&self.path, KnownHostFileKind::OpenSSH)
    }
}

/// OpenSSH writes non-default ports as `[host]:port`
fn known_hosts_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Compute SHA256 fingerprint of a key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    // Format as SHA256:base64
    let b64 = base64::engine::general_purpose::STANDARD.encode(result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// Production connector backed by libssh2
pub struct SshConnector {
    known_hosts: KnownHosts,
    keepalive_interval: u32,
    read_buffer_bytes: usize,
}

impl SshConnector {
    pub fn new(settings: &AppSettings, known_hosts_path: PathBuf) -> Self {
        Self {
            known_hosts: KnownHosts::new(known_hosts_path, settings.ssh.host_key_policy),
            keepalive_interval: settings.ssh.keepalive_interval,
            read_buffer_bytes: settings.terminal.read_buffer_bytes,
        }
    }
}

impl Connector for SshConnector {
    fn connect(&self, params: &ConnectParams) -> Result<RemoteSession, ConnectError> {
        let session = RemoteSession::connect(params, &self.known_hosts, self.keepalive_interval)?;
        Ok(session.with_read_buffer(self.read_buffer_bytes))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let test_key = b"test key data";
        let fp = compute_sha256_fingerprint(test_key);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_known_hosts_entry_format() {
        assert_eq!(known_hosts_entry("example.org", 22), "example.org");
        assert_eq!(known_hosts_entry("example.org", 2222), "[example.org]:2222");
    }

    #[test]
    fn test_connect_params_debug_hides_secret() {
        let params = ConnectParams {
            host: "h".into(),
            user: "u".into(),
            secret: "hunter2".into(),
            port: 22,
            timeout: Duration::from_secs(10),
        };
        let shown = format!("{:?}", params);
        assert!(!shown.contains("hunter2"));
        assert_eq!(params.label(), "u@h:22");
    }

    /// Wire encoding of an ssh-ed25519 public key
    fn ed25519_blob(seed: u8) -> Vec<u8> {
        let mut blob = Vec::new();
        for part in [&b"ssh-ed25519"[..], &[seed; 32][..]] {
            blob.extend_from_slice(&(part.len() as u32).to_be_bytes());
            blob.extend_from_slice(part);
        }
        blob
    }

    fn check(path: &Path, host: &str, port: u16, key: &[u8]) -> CheckResult {
        let session = Ssh2Session::new().unwrap();
        let mut known_hosts = session.known_hosts().unwrap();
        known_hosts.read_file(path, KnownHostFileKind::OpenSSH).unwrap();
        known_hosts.check_port(host, port, key)
    }

    #[test]
    fn test_ed25519_host_key_is_remembered() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let store = KnownHosts::new(&path, HostKeyPolicy::FirstUse);
        let key = ed25519_blob(7);

        let session = Ssh2Session::new().unwrap();
        let mut known_hosts = session.known_hosts().unwrap();
        store
            .remember(&mut known_hosts, "example.org", 22, &key, HostKeyType::Ed25519)
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("example.org ssh-ed25519 "));
        assert!(matches!(check(&path, "example.org", 22, &key), CheckResult::Match));
        assert!(matches!(
            check(&path, "example.org", 22, &ed25519_blob(8)),
            CheckResult::Mismatch
        ));
    }

    #[test]
    fn test_non_default_port_entry_is_bracketed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        let store = KnownHosts::new(&path, HostKeyPolicy::FirstUse);

        let session = Ssh2Session::new().unwrap();
        let mut known_hosts = session.known_hosts().unwrap();
        store
            .remember(&mut known_hosts, "example.org", 2222, &ed25519_blob(1), HostKeyType::Ed25519)
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("[example.org]:2222 ssh-ed25519 "));
    }

    #[test]
    fn test_policy_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: HostKeyPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"first-use\"").unwrap();
        assert_eq!(w.policy, HostKeyPolicy::FirstUse);
        let w: Wrapper = toml::from_str("policy = \"strict\"").unwrap();
        assert_eq!(w.policy, HostKeyPolicy::Strict);
    }
}
