//! Per-tab orchestration: one remote session, one terminal buffer, one presenter.
//!
//! [`SessionController`] is single-threaded. Bytes read by the background
//! receive loop reach it only as [`SessionEvent`]s through an mpsc channel,
//! so the terminal buffer is never shared between threads.

pub mod driver;
pub mod input;

pub use driver::*;
pub use input::*;

use crate::config::{parse_port, ConnectionProfile, ProfileStore};
use crate::error::ConnectError;
use crate::logging::sanitize;
use crate::ssh::{ConnectParams, Connector, LoopExit, RemoteSession, SessionState};
use crate::state::AppState;
use crate::terminal::TerminalBuffer;
use crate::vault::CredentialVault;
use std::fmt;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::UnboundedSender;

/// Outbound notifications to whatever draws the tab
pub trait Presenter: Send + Sync {
    /// Full display text of the terminal, cursor included
    fn on_render(&self, display_text: &str);

    /// Connection lifecycle message
    fn on_status(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    AwaitingConnection,
    Connected,
    Closed,
}

/// Hand-off from a receive loop to its controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data(Vec<u8>),
    ReadError(String),
    Ended(LoopExit),
}

/// Connection form as submitted by the user
#[derive(Clone, Default)]
pub struct ConnectRequest {
    pub host: String,
    pub user: String,
    pub secret: String,
    /// Port as typed; empty means the configured default
    pub port: String,
    pub remember: bool,
}

impl ConnectRequest {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        secret: impl Into<String>,
        port: impl Into<String>,
        remember: bool,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            secret: secret.into(),
            port: port.into(),
            remember,
        }
    }

    /// Prefill from a saved profile, recovering its secret when possible
    pub fn from_profile(profile: &ConnectionProfile, vault: &CredentialVault) -> Self {
        let secret = ProfileStore::resolve_secret(profile, vault);
        Self {
            host: profile.host.clone(),
            user: profile.user.clone(),
            remember: secret.is_some(),
            secret: secret.unwrap_or_default(),
            port: profile.port.to_string(),
        }
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("secret", &"[REDACTED]")
            .field("port", &self.port)
            .field("remember", &self.remember)
            .finish()
    }
}

pub struct SessionController {
    app: Arc<AppState>,
    presenter: Arc<dyn Presenter>,
    events: UnboundedSender<SessionEvent>,
    state: ControllerState,
    pending: Option<ConnectParams>,
    buffer: TerminalBuffer,
    session: Option<Arc<RemoteSession>>,
}

impl SessionController {
    pub fn new(
        app: Arc<AppState>,
        presenter: Arc<dyn Presenter>,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let buffer = TerminalBuffer::new(app.settings.terminal.cursor_glyph);
        Self {
            app,
            presenter,
            events,
            state: ControllerState::AwaitingConnection,
            pending: None,
            buffer,
            session: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn session_state(&self) -> SessionState {
        match &self.session {
            Some(session) => session.state(),
            None if self.state == ControllerState::Closed => SessionState::Closed,
            None if self.pending.is_some() => SessionState::Connecting,
            None => SessionState::Disconnected,
        }
    }

    pub fn buffer(&self) -> &TerminalBuffer {
        &self.buffer
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.app.connector)
    }

    /// Connect synchronously. The async driver splits this into
    /// [`prepare_connection`](Self::prepare_connection) and
    /// [`complete_connection`](Self::complete_connection) around a blocking task.
    pub fn submit_connection(&mut self, request: &ConnectRequest) {
        if let Some(params) = self.prepare_connection(request) {
            let result = self.app.connector.connect(&params);
            self.complete_connection(request, result);
        }
    }

    /// Validate the form. Returns the parameters to connect with, or `None`
    /// after reporting why not.
    pub fn prepare_connection(&mut self, request: &ConnectRequest) -> Option<ConnectParams> {
        if self.state != ControllerState::AwaitingConnection || self.pending.is_some() {
            tracing::warn!("Ignoring connection request in state {:?}", self.state);
            return None;
        }

        let host = request.host.trim();
        let user = request.user.trim();
        if host.is_empty() || user.is_empty() || request.secret.is_empty() {
            self.status("host, user and password are required");
            return None;
        }
        let port = match parse_port(&request.port, self.app.settings.ssh.default_port) {
            Ok(port) => port,
            Err(e) => {
                self.status(&e.to_string());
                return None;
            }
        };

        let params = ConnectParams {
            host: host.to_string(),
            user: user.to_string(),
            secret: request.secret.clone(),
            port,
            timeout: self.app.settings.ssh.connect_timeout(),
        };
        self.status(&format!("connecting to {}", params.label()));
        self.pending = Some(params.clone());
        Some(params)
    }

    pub fn complete_connection(
        &mut self,
        request: &ConnectRequest,
        result: Result<RemoteSession, ConnectError>,
    ) {
        let Some(params) = self.pending.take() else {
            tracing::warn!("Connection result without a pending request");
            if let Ok(session) = result {
                session.close();
            }
            return;
        };

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", params.label(), e);
                self.status(&sanitize(&e.to_string()));
                return;
            }
        };

        if self.state != ControllerState::AwaitingConnection {
            // Closed while the handshake was in flight
            session.close();
            return;
        }

        let session = Arc::new(session);
        if let Err(e) = self.start_receiver(&session) {
            session.close();
            self.status(&format!("I/O error: {}", e));
            return;
        }

        self.session = Some(session);
        self.state = ControllerState::Connected;
        self.buffer.clear();
        self.buffer.set_cursor_visible(true);
        self.status(&format!("connected to {}:{}", params.host, params.port));
        self.render();

        if request.remember {
            self.remember(&params);
        }
    }

    fn remember(&self, params: &ConnectParams) {
        let profile = ConnectionProfile::new(params.host.as_str(), params.user.as_str(), params.port);
        if let Err(e) = self
            .app
            .profiles
            .upsert(profile, Some(&params.secret), &self.app.vault)
        {
            tracing::warn!("Failed to save connection profile: {}", e);
        }
    }

    fn start_receiver(&mut self, session: &Arc<RemoteSession>) -> std::io::Result<()> {
        let worker = Arc::clone(session);
        let data_tx = self.events.clone();
        let error_tx = self.events.clone();
        let end_tx = self.events.clone();
        let poll_interval = self.app.settings.terminal.poll_interval();

        thread::Builder::new()
            .name(format!("recv-{}", session.id()))
            .spawn(move || {
                let exit = worker.receive_loop(
                    poll_interval,
                    |data| {
                        let _ = data_tx.send(SessionEvent::Data(data));
                    },
                    |message| {
                        let _ = error_tx.send(SessionEvent::ReadError(message));
                    },
                );
                let _ = end_tx.send(SessionEvent::Ended(exit));
            })?;
        Ok(())
    }

    /// Translate and forward a key. Returns text for the clipboard when the
    /// event was a copy with a selection.
    pub fn send_key_event(&mut self, event: &KeyEvent) -> Option<String> {
        match translate(event) {
            KeyAction::Send(bytes) => {
                self.send(&bytes);
                None
            }
            KeyAction::CopyToClipboard(text) => Some(text),
            KeyAction::Ignore => None,
        }
    }

    pub fn send_paste(&mut self, text: &str) {
        self.send_key_event(&KeyEvent::Paste(text.to_string()));
    }

    fn send(&mut self, bytes: &[u8]) {
        if self.state != ControllerState::Connected {
            tracing::debug!("Discarding {} input bytes in state {:?}", bytes.len(), self.state);
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = session.send(bytes) {
            let line = format!("\n[!] send failed: {}\n", sanitize(&e.to_string()));
            self.buffer.append_text(&line);
            self.render();
        }
    }

    /// Empty the buffer and, if connected, ask the shell to redraw its prompt
    pub fn request_clear(&mut self) {
        if self.state == ControllerState::Closed {
            return;
        }
        self.buffer.clear();
        self.render();
        if self.state == ControllerState::Connected {
            self.send(b"\r");
        }
    }

    pub fn request_close(&mut self) {
        if self.state == ControllerState::Closed {
            return;
        }
        self.shutdown();
        self.status("session closed");
    }

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        if self.state != ControllerState::Connected {
            return;
        }
        match event {
            SessionEvent::Data(data) => {
                self.buffer.append(&data);
                self.render();
            }
            SessionEvent::ReadError(message) => {
                tracing::warn!("Receive error: {}", message);
            }
            SessionEvent::Ended(LoopExit::Closed) => {}
            SessionEvent::Ended(LoopExit::Eof) => {
                self.shutdown();
                self.status("connection closed by remote host");
            }
            SessionEvent::Ended(LoopExit::Broken(message)) => {
                self.shutdown();
                self.status(&format!("connection lost: {}", sanitize(&message)));
            }
        }
    }

    /// Cursor blink tick
    pub fn blink(&mut self) {
        if self.state != ControllerState::Connected || !self.app.settings.terminal.cursor_blink {
            return;
        }
        self.buffer.toggle_cursor();
        self.render();
    }

    fn shutdown(&mut self) {
        self.state = ControllerState::Closed;
        // The receive thread notices within one poll interval; anything it
        // already queued is dropped by the Closed check in handle_session_event
        if let Some(session) = &self.session {
            session.close();
        }
    }

    fn render(&self) {
        self.presenter.on_render(&self.buffer.snapshot());
    }

    fn status(&self, message: &str) {
        tracing::info!("{}", message);
        self.presenter.on_status(message);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.state != ControllerState::Closed {
            self.shutdown();
        }
    }
}
