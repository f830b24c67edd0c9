use super::{ConnectParams, KnownHosts, ShellTransport};
use crate::error::{ConnectError, SendError};
use parking_lot::{Mutex, RwLock};
use ssh2::{Channel, Session as Ssh2Session};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

/// Consecutive non-transient read failures tolerated before the channel is treated as broken
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

const DEFAULT_READ_BUFFER: usize = 4096;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Why a receive loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Closed locally
    Closed,
    /// Remote end closed the channel
    Eof,
    /// Repeated read failures
    Broken(String),
}

enum ReadOutcome {
    Data(Vec<u8>),
    Idle,
    Eof,
    Failed(String),
}

/// One authenticated shell channel. Owns its transport exclusively.
pub struct RemoteSession {
    id: String,
    label: String,
    state: RwLock<SessionState>,
    transport: Mutex<Option<Box<dyn ShellTransport>>>,
    keepalive_interval: Option<Duration>,
    read_buffer_bytes: usize,
}

impl RemoteSession {
    /// Wrap an already established shell
    pub fn from_transport(label: impl Into<String>, transport: Box<dyn ShellTransport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            state: RwLock::new(SessionState::Connected),
            transport: Mutex::new(Some(transport)),
            keepalive_interval: None,
            read_buffer_bytes: DEFAULT_READ_BUFFER,
        }
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(1);
        self
    }

    /// Connect, authenticate with a password and start an interactive shell.
    pub fn connect(
        params: &ConnectParams,
        known_hosts: &KnownHosts,
        keepalive_interval: u32,
    ) -> Result<Self, ConnectError> {
        // Log connection attempt (no secrets!)
        tracing::info!("Connecting to {}", params.label());

        let tcp = open_tcp(&params.host, params.port, params.timeout)?;
        // Disable Nagle's algorithm for better latency
        tcp.set_nodelay(true).map_err(|e| ConnectError::from_io(&e))?;

        let mut ssh_session = Ssh2Session::new().map_err(|e| ConnectError::from_ssh(&e))?;
        ssh_session.set_tcp_stream(tcp);
        ssh_session.set_timeout(params.timeout.as_millis().min(u32::MAX as u128) as u32);

        ssh_session.handshake().map_err(|e| ConnectError::from_ssh(&e))?;

        known_hosts.verify(&ssh_session, &params.host, params.port)?;

        authenticate(&ssh_session, params)?;

        let channel = open_interactive_channel(&ssh_session)?;

        let keepalive_interval = if keepalive_interval > 0 {
            ssh_session.set_keepalive(true, keepalive_interval);
            Some(Duration::from_secs(keepalive_interval as u64))
        } else {
            None
        };

        // Reads poll; writes switch back to blocking for their duration
        ssh_session.set_blocking(false);

        let mut session = Self::from_transport(
            params.label(),
            Box::new(SshShell {
                session: ssh_session,
                channel,
            }),
        );
        session.keepalive_interval = keepalive_interval;

        tracing::info!("SSH connected successfully (session {})", session.id);
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `user@host:port`
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Write raw bytes to the shell. Writers are serialized by the transport lock.
    pub fn send(&self, data: &[u8]) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let mut guard = self.transport.lock();
        let transport = guard.as_mut().ok_or(SendError::Closed)?;
        transport.write_all(data).map_err(|e| {
            tracing::error!("Write error (session {}): {}", self.id, e);
            SendError::Io(e.to_string())
        })
    }

    /// Poll the channel until it closes, handing every non-empty read to `on_data`.
    ///
    /// Transient "no data yet" conditions are swallowed. Other read failures go
    /// to `on_error` and polling continues, unless the channel reports EOF or
    /// failures keep repeating. Returns as soon as [`RemoteSession::close`] is
    /// observed, without invoking either callback again.
    pub fn receive_loop<D, E>(&self, poll_interval: Duration, mut on_data: D, mut on_error: E) -> LoopExit
    where
        D: FnMut(Vec<u8>),
        E: FnMut(String),
    {
        let mut read_buf = vec![0u8; self.read_buffer_bytes];
        let mut consecutive_errors = 0;
        let mut last_keepalive = Instant::now();

        tracing::debug!("Entering receive loop (session {})", self.id);
        loop {
            if !self.is_open() {
                return LoopExit::Closed;
            }

            let outcome = {
                let mut guard = self.transport.lock();
                let Some(transport) = guard.as_mut() else {
                    return LoopExit::Closed;
                };

                if let Some(interval) = self.keepalive_interval {
                    if last_keepalive.elapsed() >= interval {
                        match transport.keepalive() {
                            Ok(()) => tracing::debug!("Keepalive sent (session {})", self.id),
                            Err(e) => tracing::warn!("Keepalive send failed (session {}): {}", self.id, e),
                        }
                        last_keepalive = Instant::now();
                    }
                }

                read_available(transport.as_mut(), &mut read_buf)
            };

            match outcome {
                ReadOutcome::Data(data) => {
                    consecutive_errors = 0;
                    if !self.is_open() {
                        return LoopExit::Closed;
                    }
                    on_data(data);
                    // Drain whatever else is pending before sleeping
                    continue;
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Eof => {
                    tracing::info!("SSH channel closed by remote (session {})", self.id);
                    return LoopExit::Eof;
                }
                ReadOutcome::Failed(message) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        "Read error (session {}): {}; count={}",
                        self.id,
                        message,
                        consecutive_errors
                    );
                    if !self.is_open() {
                        return LoopExit::Closed;
                    }
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!("Too many consecutive errors, closing session {}", self.id);
                        return LoopExit::Broken(message);
                    }
                    on_error(message);
                }
            }

            thread::sleep(poll_interval);
        }
    }

    /// Close the channel and transport. Safe to call repeatedly and from any thread.
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        if let Some(mut transport) = self.transport.lock().take() {
            if let Err(e) = transport.close() {
                tracing::debug!("Error while closing session {}: {}", self.id, e);
            }
        }
        tracing::info!("Session {} ({}) closed", self.id, self.label);
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_available(transport: &mut dyn ShellTransport, buf: &mut [u8]) -> ReadOutcome {
    match transport.read(buf) {
        Ok(0) => idle_or_eof(transport),
        Ok(n) => ReadOutcome::Data(buf[..n].to_vec()),
        Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
            idle_or_eof(transport)
        }
        Err(e) => {
            let message = e.to_string();
            if is_recoverable_error(&message.to_lowercase()) {
                idle_or_eof(transport)
            } else if transport.is_eof() {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Failed(message)
            }
        }
    }
}

fn idle_or_eof(transport: &dyn ShellTransport) -> ReadOutcome {
    if transport.is_eof() {
        ReadOutcome::Eof
    } else {
        ReadOutcome::Idle
    }
}

/// Check if an error message indicates a recoverable (transient) error
fn is_recoverable_error(err_str: &str) -> bool {
    // These are errors that indicate "try again later" rather than a fatal error
    err_str.contains("would block")
        || err_str.contains("wouldblock")
        || err_str.contains("eagain")
        || err_str.contains("try again")
        || err_str.contains("temporarily")
        || err_str.contains("timed out")
        || err_str.contains("-37") // libssh2 EAGAIN code
}

/// Resolve and connect, spending at most `timeout` across all resolved addresses
fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let deadline = Instant::now() + timeout;
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConnectError::IOError(format!("Cannot resolve {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::IOError(format!("No address found for {}", host)));
    }

    let mut last_error = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectError::Timeout);
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                tracing::debug!("TCP connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .map(|e| ConnectError::from_io(&e))
        .unwrap_or(ConnectError::Timeout))
}

/// Authenticate with the SSH server
fn authenticate(ssh_session: &Ssh2Session, params: &ConnectParams) -> Result<(), ConnectError> {
    ssh_session
        .userauth_password(&params.user, &params.secret)
        .map_err(|e| match ConnectError::from_ssh(&e) {
            ConnectError::Timeout => ConnectError::Timeout,
            ConnectError::IOError(detail) => ConnectError::IOError(detail),
            _ => ConnectError::AuthFailed("Password authentication failed".to_string()),
        })?;

    if !ssh_session.authenticated() {
        return Err(ConnectError::AuthFailed("Authentication failed".to_string()));
    }

    tracing::info!("SSH authentication successful for {}", params.label());
    Ok(())
}

/// Open an interactive shell, falling back to a login shell via exec
fn open_interactive_channel(ssh_session: &Ssh2Session) -> Result<Channel, ConnectError> {
    // Helper to request PTY + merge stderr
    let open_channel = |label: &str| -> Result<Channel, ssh2::Error> {
        tracing::debug!("Opening channel [{}]", label);
        let mut ch = ssh_session.channel_session()?;
        ch.handle_extended_data(ssh2::ExtendedData::Merge)?;
        ch.request_pty("xterm", None, Some((80, 24, 0, 0)))?;
        Ok(ch)
    };

    let mut last_error = None;

    match open_channel("shell") {
        Ok(mut ch) => match ch.shell() {
            Ok(()) => {
                tracing::debug!("Shell started");
                return Ok(ch);
            }
            Err(e) => {
                tracing::debug!("Shell request refused: {}", e);
                let _ = ch.close();
                last_error = Some(e);
            }
        },
        Err(e) => last_error = Some(e),
    }

    match open_channel("exec") {
        Ok(mut ch) => match ch.exec("sh -l") {
            Ok(()) => {
                tracing::debug!("Exec shell started with 'sh -l'");
                return Ok(ch);
            }
            Err(e) => {
                let _ = ch.close();
                last_error = Some(e);
            }
        },
        Err(e) => last_error = Some(e),
    }

    Err(ConnectError::ProtocolError(match last_error {
        Some(e) => format!("Failed to start interactive shell: {}", e.message()),
        None => "Failed to start interactive shell".to_string(),
    }))
}

/// libssh2 session and its shell channel
struct SshShell {
    session: Ssh2Session,
    channel: Channel,
}

impl ShellTransport for SshShell {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.session.set_blocking(true);
        let result = Write::write_all(&mut self.channel, data).and_then(|_| self.channel.flush());
        self.session.set_blocking(false);
        result
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn keepalive(&mut self) -> io::Result<()> {
        self.session.set_blocking(true);
        let result = self.session.keepalive_send();
        self.session.set_blocking(false);
        result.map(|_| ()).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        self.session.set_blocking(true);
        let _ = self.channel.close();
        self.session
            .disconnect(None, "closed by user", None)
            .map_err(io::Error::from)
    }
}
