use super::{
    translate, ConnectRequest, ControllerState, KeyAction, KeyEvent, Presenter, SessionController,
    SessionEvent,
};
use crate::error::ConnectError;
use crate::ssh::RemoteSession;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Requests from the UI thread to a tab's control task
#[derive(Debug)]
pub enum ControlCommand {
    Connect(ConnectRequest),
    Key(KeyEvent),
    Clear,
    Close(oneshot::Sender<()>),
}

/// Cloneable front of a tab. Every method except `request_close` returns
/// immediately; the work happens on the tab's control task.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
}

/// Start the control task for a new tab. Must be called within a tokio runtime.
pub fn spawn(app: Arc<AppState>, presenter: Arc<dyn Presenter>) -> (ControllerHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let blink_interval = app.settings.terminal.blink_interval();
    let controller = SessionController::new(app, presenter, event_tx);
    let task = tokio::spawn(run(controller, command_rx, event_rx, blink_interval));

    (ControllerHandle { commands: command_tx }, task)
}

impl ControllerHandle {
    pub fn submit_connection(
        &self,
        host: impl Into<String>,
        user: impl Into<String>,
        secret: impl Into<String>,
        port: impl Into<String>,
        remember: bool,
    ) {
        self.submit(ConnectRequest::new(host, user, secret, port, remember));
    }

    pub fn submit(&self, request: ConnectRequest) {
        self.command(ControlCommand::Connect(request));
    }

    /// Returns clipboard text for a copy with a selection; everything else is
    /// forwarded to the session.
    pub fn send_key_event(&self, event: KeyEvent) -> Option<String> {
        if let KeyAction::CopyToClipboard(text) = translate(&event) {
            return Some(text);
        }
        self.command(ControlCommand::Key(event));
        None
    }

    pub fn send_paste(&self, text: impl Into<String>) {
        self.command(ControlCommand::Key(KeyEvent::Paste(text.into())));
    }

    pub fn request_clear(&self) {
        self.command(ControlCommand::Clear);
    }

    /// Close the tab's session. Resolves once no further render or status
    /// notification can be emitted.
    pub async fn request_close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(ControlCommand::Close(ack_tx)).is_ok() {
            // A dropped ack means the task already finished
            let _ = ack_rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn command(&self, command: ControlCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Tab already closed; dropping command");
        }
    }
}

type ConnectTask = JoinHandle<Result<RemoteSession, ConnectError>>;

async fn run(
    mut controller: SessionController,
    mut commands: mpsc::UnboundedReceiver<ControlCommand>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    blink_interval: std::time::Duration,
) {
    let mut blink = tokio::time::interval(blink_interval);
    blink.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Handshake running on the blocking pool, with the request that started it
    let mut connecting: Option<(ConnectRequest, ConnectTask)> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ControlCommand::Connect(request)) => {
                    if let Some(params) = controller.prepare_connection(&request) {
                        let connector = controller.connector();
                        let task = tokio::task::spawn_blocking(move || connector.connect(&params));
                        connecting = Some((request, task));
                    }
                }
                Some(ControlCommand::Key(event)) => {
                    controller.send_key_event(&event);
                }
                Some(ControlCommand::Clear) => controller.request_clear(),
                Some(ControlCommand::Close(ack)) => {
                    controller.request_close();
                    let _ = ack.send(());
                    break;
                }
                None => {
                    controller.request_close();
                    break;
                }
            },
            result = finish_connect(&mut connecting), if connecting.is_some() => {
                if let Some((request, _)) = connecting.take() {
                    controller.complete_connection(&request, result);
                }
            }
            Some(event) = events.recv() => controller.handle_session_event(event),
            _ = blink.tick() => controller.blink(),
        }

        if controller.state() == ControllerState::Closed {
            break;
        }
    }
    // An abandoned handshake finishes on its own; the session it yields is
    // dropped, which closes it.
    tracing::debug!("Control task finished");
}

async fn finish_connect(connecting: &mut Option<(ConnectRequest, ConnectTask)>) -> Result<RemoteSession, ConnectError> {
    match connecting {
        Some((_, task)) => task
            .await
            .unwrap_or_else(|e| Err(ConnectError::IOError(format!("connect task failed: {}", e)))),
        None => std::future::pending().await,
    }
}
