use thiserror::Error;

/// Failure while establishing a remote session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("I/O error: {0}")]
    IOError(String),
}

impl ConnectError {
    /// Classify an I/O failure from the TCP layer.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnectError::Timeout,
            _ => ConnectError::IOError(err.to_string()),
        }
    }

    /// Classify a libssh2 failure raised during handshake or channel setup.
    pub fn from_ssh(err: &ssh2::Error) -> Self {
        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => ConnectError::Timeout,
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV)
            | ssh2::ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
            | ssh2::ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT) => {
                ConnectError::IOError(err.message().to_string())
            }
            _ => ConnectError::ProtocolError(err.message().to_string()),
        }
    }
}

const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// Failure writing to an open shell channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("session closed")]
    Closed,

    #[error("write failed: {0}")]
    Io(String),
}

/// A stored secret could not be recovered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("stored secret is malformed")]
    Malformed,

    #[error("stored secret failed authentication (wrong key or tampered)")]
    Authentication,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Profile store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
        assert_eq!(ConnectError::from_io(&err), ConnectError::Timeout);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ConnectError::from_io(&refused), ConnectError::IOError(_)));
    }

    #[test]
    fn test_ssh_timeout_code_maps_to_timeout() {
        let err = ssh2::Error::new(ssh2::ErrorCode::Session(-9), "Timed out waiting on socket");
        assert_eq!(ConnectError::from_ssh(&err), ConnectError::Timeout);

        let kex = ssh2::Error::new(ssh2::ErrorCode::Session(-5), "Unable to exchange encryption keys");
        assert!(matches!(ConnectError::from_ssh(&kex), ConnectError::ProtocolError(_)));
    }

    #[test]
    fn test_auth_message_is_distinct() {
        let auth = ConnectError::AuthFailed("password rejected".into()).to_string();
        let proto = ConnectError::ProtocolError("kex failure".into()).to_string();
        assert!(auth.starts_with("authentication failed"));
        assert!(!proto.contains("authentication"));
    }
}
