use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tabshell::config::{get_config_dir, parse_port, ConnectionProfile, ProfileStore};
use tabshell::controller::{ConnectRequest, KeyEvent, Presenter};
use tabshell::logging;
use tabshell::state::AppState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const USAGE: &str = "usage: tabshell [--remember] [user@]host[:port]";

/// Prints terminal output incrementally to stdout and status lines to stderr
struct ConsolePresenter {
    cursor_glyph: char,
    shown: Mutex<String>,
    statuses: mpsc::UnboundedSender<String>,
}

impl Presenter for ConsolePresenter {
    fn on_render(&self, display_text: &str) {
        let text = display_text
            .strip_suffix(self.cursor_glyph)
            .unwrap_or(display_text);
        let mut shown = self.shown.lock();
        if *shown == text {
            return;
        }

        let common = shown
            .char_indices()
            .zip(text.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, a), _)| i + a.len_utf8());
        let erased = shown[common..].chars().count();

        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}{}", "\x08 \x08".repeat(erased), &text[common..]);
        let _ = stdout.flush();
        *shown = text.to_string();
    }

    fn on_status(&self, message: &str) {
        eprintln!("[tabshell] {}", message);
        let _ = self.statuses.send(message.to_string());
    }
}

struct Args {
    remember: bool,
    target: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        remember: false,
        target: None,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--remember" => args.remember = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            _ if arg.starts_with('-') => bail!("unknown option {}\n{}", arg, USAGE),
            _ if args.target.is_some() => bail!("more than one target given\n{}", USAGE),
            _ => args.target = Some(arg),
        }
    }
    Ok(args)
}

/// Split `[user@]host[:port]`; the port stays text so the controller validates it
fn parse_target(target: &str) -> (String, String, String) {
    let (user, rest) = match target.rsplit_once('@') {
        Some((user, rest)) => (user.to_string(), rest),
        None => (std::env::var("USER").unwrap_or_default(), target),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host.to_string(), port.to_string()),
        _ => (rest.to_string(), String::new()),
    };
    (user, host, port)
}

fn build_request(app: &AppState, args: &Args) -> Result<ConnectRequest> {
    let saved = app.saved_profiles();

    let mut request = match &args.target {
        Some(target) => {
            let (user, host, port) = parse_target(target);
            let mut request = ConnectRequest::new(host, user, "", port, false);
            // Reuse a stored secret for a known target
            if let Ok(port) = parse_port(&request.port, app.settings.ssh.default_port) {
                let wanted = ConnectionProfile::new(request.host.as_str(), request.user.as_str(), port);
                if let Some(secret) = saved
                    .iter()
                    .find(|p| p.same_target(&wanted))
                    .and_then(|p| ProfileStore::resolve_secret(p, &app.vault))
                {
                    request.secret = secret;
                }
            }
            request
        }
        None => match saved.first() {
            Some(profile) => {
                eprintln!("[tabshell] using saved profile {}", profile.label());
                ConnectRequest::from_profile(profile, &app.vault)
            }
            None => bail!("no saved connections\n{}", USAGE),
        },
    };
    request.remember |= args.remember;

    if request.secret.is_empty() {
        if let Ok(secret) = std::env::var("TABSHELL_PASSWORD") {
            request.secret = secret;
        }
    }
    Ok(request)
}

#[tokio::main]
async fn main() {
    logging::init(logging::DEFAULT_FILTER);

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("tabshell: {:#}", e);
            1
        }
    };
    // The stdin reader may still be parked in a blocking read
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let args = parse_args()?;
    let config_dir = get_config_dir()?;
    let app = Arc::new(AppState::new(&config_dir).context("failed to load configuration")?);
    let mut request = build_request(&app, &args)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if request.secret.is_empty() {
        eprint!("password for {}@{}: ", request.user, request.host);
        request.secret = lines
            .next_line()
            .await?
            .context("no password given")?;
    }

    let (status_tx, mut statuses) = mpsc::unbounded_channel();
    let presenter = Arc::new(ConsolePresenter {
        cursor_glyph: app.settings.terminal.cursor_glyph,
        shown: Mutex::new(String::new()),
        statuses: status_tx,
    });
    let (handle, mut task) = app.open_tab(presenter);
    handle.submit(request);

    let mut connected = false;
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    handle.send_paste(line);
                    handle.send_key_event(KeyEvent::Enter);
                }
                None => {
                    stdin_open = false;
                    handle.request_close().await;
                }
            },
            Some(status) = statuses.recv() => {
                if status.starts_with("connected to") {
                    connected = true;
                } else if !connected && stdin_open && !status.starts_with("connecting to") {
                    handle.request_close().await;
                    bail!("{}", status);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                // Interrupt the remote foreground process
                handle.send_key_event(KeyEvent::Copy { selection: None });
            }
            _ = &mut task => break,
        }
    }
    println!();
    Ok(())
}
