//! Encryption of stored connection secrets.
//!
//! Secrets are sealed with AES-256-GCM under a single key kept in a file
//! next to the profile store. The key is created on first use and never
//! rotated: if the file disappears, a fresh key is generated and every
//! previously stored secret becomes undecryptable (decrypt reports
//! [`DecryptionError`], callers treat that as "no stored secret").

use crate::error::{AppError, AppResult, DecryptionError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::Engine;
use rand::RngCore;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// GCM authentication tag appended to every ciphertext
const TAG_LEN: usize = 16;

/// Symmetric key shared by every stored secret
#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Load the key at `path`, creating it if the file does not exist.
    ///
    /// A new key is written to a temp file and hard-linked into place, so
    /// `path` either holds a complete key or does not exist. An existing
    /// non-empty file is never overwritten, even if it is malformed.
    pub fn generate_or_load(path: &Path) -> AppResult<Self> {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => return Self::load(path),
            Ok(_) => {
                // Nothing was ever sealed under an empty key file
                tracing::warn!("Key file {:?} is empty; generating a new key", path);
                match fs::remove_file(path) {
                    Err(e) if e.kind() != ErrorKind::NotFound => {
                        return Err(AppError::Vault(format!("Failed to remove empty key file: {}", e)));
                    }
                    _ => {}
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(AppError::Vault(format!("Failed to inspect key file: {}", e))),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let key = Self::generate();
        let temp_path = temp_key_path(path);
        write_key_file(&temp_path, &key)
            .map_err(|e| AppError::Vault(format!("Failed to write key file: {}", e)))?;

        let published = fs::hard_link(&temp_path, path);
        let _ = fs::remove_file(&temp_path);
        match published {
            Ok(()) => {
                tracing::info!("Generated new vault key at {:?}", path);
                Ok(key)
            }
            // Another writer got there first; use theirs.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Self::load(path),
            Err(e) => Err(AppError::Vault(format!("Failed to create key file: {}", e))),
        }
    }

    fn load(path: &Path) -> AppResult<Self> {
        let data = fs::read(path)
            .map_err(|e| AppError::Vault(format!("Failed to read key file: {}", e)))?;
        let key: [u8; KEY_LEN] = data.as_slice().try_into().map_err(|_| {
            AppError::Vault(format!(
                "Key file {:?} has {} bytes, expected {}",
                path,
                data.len(),
                KEY_LEN
            ))
        })?;
        Ok(Self(key))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey([REDACTED])")
    }
}

/// Unique sibling of `path` so concurrent creators never share a temp file
fn temp_key_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vault.key".to_string());
    path.with_file_name(format!("{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

fn write_key_file(path: &Path, key: &VaultKey) -> std::io::Result<()> {
    let mut file = create_key_file(path)?;
    let written = file.write_all(&key.0).and_then(|_| file.sync_all());
    if written.is_err() {
        let _ = fs::remove_file(path);
    }
    written
}

#[cfg(unix)]
fn create_key_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_key_file(path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Seals and opens stored passwords
pub struct CredentialVault {
    cipher: Aes256Gcm,
    key_path: Option<PathBuf>,
}

impl CredentialVault {
    pub fn new(key: &VaultKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
            key_path: None,
        }
    }

    /// Open the vault backed by the key file at `key_path`
    pub fn open(key_path: &Path) -> AppResult<Self> {
        let key = VaultKey::generate_or_load(key_path)?;
        let mut vault = Self::new(&key);
        vault.key_path = Some(key_path.to_path_buf());
        Ok(vault)
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Encrypt `plaintext` into a self-contained base64 blob (nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Vault(format!("Failed to encrypt secret: {}", e)))?;

        let mut output = nonce_bytes.to_vec();
        output.extend(ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(output))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, DecryptionError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|_| DecryptionError::Malformed)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptionError::Malformed);
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DecryptionError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| DecryptionError::Malformed)
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let vault = CredentialVault::new(&VaultKey::generate());
        let long = "x".repeat(4096);
        for secret in ["", "hunter2", "pässwörd with spaces ✓", long.as_str()] {
            let blob = vault.encrypt(secret).unwrap();
            assert_eq!(vault.decrypt(&blob).unwrap(), secret);
        }
    }

    #[test]
    fn test_nonce_differs_per_encryption() {
        let vault = CredentialVault::new(&VaultKey::generate());
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let vault = CredentialVault::new(&VaultKey::generate());
        let other = CredentialVault::new(&VaultKey::generate());
        let blob = vault.encrypt("secret").unwrap();
        assert_eq!(other.decrypt(&blob), Err(DecryptionError::Authentication));
    }

    #[test]
    fn test_tampered_blob_is_rejected() {
        let vault = CredentialVault::new(&VaultKey::generate());
        let blob = vault.encrypt("secret").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        assert_eq!(vault.decrypt(&tampered), Err(DecryptionError::Authentication));
    }

    #[test]
    fn test_malformed_blob() {
        let vault = CredentialVault::new(&VaultKey::generate());
        assert_eq!(vault.decrypt("not base64 !!"), Err(DecryptionError::Malformed));
        assert_eq!(vault.decrypt("AAAA"), Err(DecryptionError::Malformed));
    }

    #[test]
    fn test_key_file_created_once_and_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(".vault.key");

        let first = VaultKey::generate_or_load(&path).unwrap();
        let second = VaultKey::generate_or_load(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_malformed_key_file_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".vault.key");
        fs::write(&path, b"short").unwrap();

        assert!(matches!(VaultKey::generate_or_load(&path), Err(AppError::Vault(_))));
        assert_eq!(fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn test_lost_key_strands_old_secrets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".vault.key");

        let blob = CredentialVault::open(&path).unwrap().encrypt("secret").unwrap();
        fs::remove_file(&path).unwrap();

        let regenerated = CredentialVault::open(&path).unwrap();
        assert!(regenerated.decrypt(&blob).is_err());
    }

    #[test]
    fn test_empty_key_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".vault.key");
        fs::write(&path, b"").unwrap();

        let key = VaultKey::generate_or_load(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), key.0.to_vec());
        assert_eq!(VaultKey::generate_or_load(&path).unwrap(), key);
    }

    #[test]
    fn test_key_creation_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".vault.key");
        VaultKey::generate_or_load(&path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![".vault.key".to_string()]);
    }

    #[test]
    fn test_concurrent_creators_agree_on_one_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".vault.key");

        let keys: Vec<VaultKey> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| VaultKey::generate_or_load(&path).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(keys.iter().all(|k| *k == keys[0]));
        assert_eq!(fs::read(&path).unwrap(), keys[0].0.to_vec());
    }

    proptest! {
        #[test]
        fn prop_round_trip_any_string(secret in "\\PC{0,256}") {
            let vault = CredentialVault::new(&VaultKey::generate());
            let blob = vault.encrypt(&secret).unwrap();
            prop_assert_eq!(vault.decrypt(&blob).unwrap(), secret);
        }

        #[test]
        fn prop_other_key_never_decrypts(secret in any::<String>()) {
            let vault = CredentialVault::new(&VaultKey::generate());
            let other = CredentialVault::new(&VaultKey::generate());
            let blob = vault.encrypt(&secret).unwrap();
            prop_assert_eq!(other.decrypt(&blob), Err(DecryptionError::Authentication));
        }
    }
}
