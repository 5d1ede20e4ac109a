//! Control socket: one command per connection, one reply line back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::channel::mpsc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

use crate::message::InboundEvent;
use crate::theme::ThemeMode;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Theme(ThemeMode),
    ThemeToggle,
    /// The named frame finished loading.
    Loaded(String),
    /// The named frame reported `SHINY_READY` from its own origin.
    Ready(String),
    /// Raw inbound message event.
    Message(InboundEvent),
    Status,
}

/// A parsed command plus the channel its reply line goes back on.
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<String>,
}

pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime_dir).join("modesync.sock")
}

pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "theme dark" => Some(Command::Theme(ThemeMode::Dark)),
        "theme light" => Some(Command::Theme(ThemeMode::Light)),
        "theme auto" => Some(Command::Theme(ThemeMode::Auto)),
        "theme-toggle" => Some(Command::ThemeToggle),
        "status" => Some(Command::Status),
        cmd if cmd.starts_with("loaded ") => Some(Command::Loaded(cmd[7..].trim().to_string())),
        cmd if cmd.starts_with("ready ") => Some(Command::Ready(cmd[6..].trim().to_string())),
        cmd if cmd.starts_with("message ") => {
            let (origin, payload) = cmd[8..].trim().split_once(' ')?;
            let data = serde_json::from_str(payload.trim()).ok()?;
            Some(Command::Message(InboundEvent::new(origin, data)))
        }
        _ => None,
    }
}

/// Bind the control socket and forward commands. Ends when the receiver
/// is dropped.
pub fn socket_listener(path: &Path) -> std::io::Result<mpsc::UnboundedReceiver<Request>> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "control socket listening");

    let (tx, rx) = mpsc::unbounded();
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => {
                    failures = 0;
                    stream
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    tracing::warn!(failures, ?delay, "control socket accept failed: {e}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            if tx.is_closed() {
                break;
            }
            tokio::spawn(serve(stream, tx.clone()));
        }
    });
    Ok(rx)
}

/// Delay before the next accept after `failures` consecutive errors
/// (e.g. EMFILE). Doubles from 10ms, capped at 1s.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    (ACCEPT_BACKOFF_MIN * (1u32 << shift)).min(ACCEPT_BACKOFF_MAX)
}

async fn serve(stream: UnixStream, tx: mpsc::UnboundedSender<Request>) {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    if let Err(e) = BufReader::new(read).read_line(&mut line).await {
        tracing::warn!("control socket read failed: {e}");
        return;
    }
    let reply = match parse_command(&line) {
        Some(command) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx
                .unbounded_send(Request {
                    command,
                    reply: reply_tx,
                })
                .is_err()
            {
                return;
            }
            reply_rx.await.unwrap_or_else(|_| "error: daemon shutting down".to_string())
        }
        None => {
            tracing::warn!(command = line.trim(), "unknown command");
            format!("error: unknown command {:?}", line.trim())
        }
    };
    if let Err(e) = write.write_all(format!("{reply}\n").as_bytes()).await {
        tracing::debug!("control reply not delivered: {e}");
    }
}
