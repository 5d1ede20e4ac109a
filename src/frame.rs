//! Subordinates reachable over a local Unix socket.
//!
//! Messages go out as one JSON object per line on the frame's socket. The
//! frame's address lives in `<label>.url` next to it, rewritten whenever the
//! host navigates the frame.
//!
//! Socket writes happen on a per-frame writer thread so a stalled peer never
//! holds up the runtime. `post_message` only validates and queues the line;
//! queued lines are written in order.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::FrameConfig;
use crate::error::SendError;
use crate::message::OutboundMessage;
use crate::subordinate::Subordinate;

const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

pub struct SocketFrame {
    label: String,
    origin: String,
    socket: PathBuf,
    address_file: PathBuf,
    location: Mutex<String>,
    writer: mpsc::UnboundedSender<String>,
}

impl SocketFrame {
    /// Fails only if the writer thread cannot be spawned.
    pub fn new(cfg: &FrameConfig, state_dir: &Path) -> io::Result<Self> {
        let (writer, lines) = mpsc::unbounded_channel();
        let label = cfg.label.clone();
        let socket = cfg.socket.clone();
        thread::Builder::new()
            .name(format!("frame-{}", cfg.label))
            .spawn(move || write_loop(&label, &socket, lines))?;
        Ok(Self {
            label: cfg.label.clone(),
            origin: cfg.origin.clone(),
            socket: cfg.socket.clone(),
            address_file: state_dir.join(format!("{}.url", cfg.label)),
            location: Mutex::new(cfg.url.clone()),
            writer,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn address_file(&self) -> &Path {
        &self.address_file
    }
}

impl Subordinate for SocketFrame {
    fn is_reachable(&self) -> bool {
        self.socket.exists()
    }

    fn post_message(
        &self,
        message: &OutboundMessage,
        target_origin: &str,
    ) -> Result<(), SendError> {
        if target_origin != self.origin {
            return Err(SendError::OriginMismatch {
                target: target_origin.to_string(),
                actual: self.origin.clone(),
            });
        }
        if !self.socket.exists() {
            return Err(SendError::Closed);
        }
        let line = message.to_json()?;
        self.writer.send(line).map_err(|_| SendError::Closed)
    }

    fn location(&self) -> Option<String> {
        let location = self.location.lock();
        if location.is_empty() {
            None
        } else {
            Some(location.clone())
        }
    }

    fn navigate(&self, url: &str) -> Result<(), SendError> {
        if let Some(parent) = self.address_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.address_file, format!("{url}\n"))?;
        *self.location.lock() = url.to_string();
        Ok(())
    }
}

// Runs until the frame (and with it the sender) is dropped.
fn write_loop(label: &str, socket: &Path, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.blocking_recv() {
        if let Err(e) = write_line(socket, &line) {
            tracing::debug!(label, "frame write failed: {e}");
        }
    }
}

fn write_line(socket: &Path, line: &str) -> Result<(), SendError> {
    let mut stream = UnixStream::connect(socket).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => SendError::Closed,
        _ => SendError::Io(e),
    })?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    writeln!(stream, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Source;
    use std::io::BufRead;
    use std::os::unix::net::UnixListener;

    fn config(dir: &Path) -> FrameConfig {
        FrameConfig {
            label: "analysis".into(),
            url: "http://127.0.0.1:3838/".into(),
            origin: "http://127.0.0.1:3838".into(),
            socket: dir.join("analysis.sock"),
        }
    }

    #[test]
    fn unreachable_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let frame = SocketFrame::new(&config(dir.path()), dir.path()).unwrap();
        assert!(!frame.is_reachable());
        let msg = OutboundMessage::dark_mode(true, Source::Registry);
        assert!(matches!(
            frame.post_message(&msg, "http://127.0.0.1:3838"),
            Err(SendError::Closed)
        ));
    }

    #[test]
    fn posts_json_line_to_socket() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let listener = UnixListener::bind(&cfg.socket).unwrap();
        let frame = SocketFrame::new(&cfg, dir.path()).unwrap();
        assert!(frame.is_reachable());

        let msg = OutboundMessage::dark_mode(true, Source::Registry);
        frame.post_message(&msg, "http://127.0.0.1:3838").unwrap();

        let (stream, _) = listener.accept().unwrap();
        let mut line = String::new();
        std::io::BufReader::new(stream).read_line(&mut line).unwrap();
        let received: OutboundMessage = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(received, msg);
    }

    #[test]
    fn queued_posts_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let listener = UnixListener::bind(&cfg.socket).unwrap();
        let frame = SocketFrame::new(&cfg, dir.path()).unwrap();

        // Nobody is accepting yet; posting still returns straight away.
        for value in [true, false, true] {
            let msg = OutboundMessage::dark_mode(value, Source::Registry);
            frame.post_message(&msg, "http://127.0.0.1:3838").unwrap();
        }

        let mut values = Vec::new();
        for _ in 0..3 {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            std::io::BufReader::new(stream).read_line(&mut line).unwrap();
            let received: OutboundMessage = serde_json::from_str(line.trim()).unwrap();
            values.push(received.mode_value().unwrap());
        }
        assert_eq!(values, vec![true, false, true]);
    }

    #[test]
    fn rejects_foreign_target_origin() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let _listener = UnixListener::bind(&cfg.socket).unwrap();
        let frame = SocketFrame::new(&cfg, dir.path()).unwrap();
        let msg = OutboundMessage::request_ready(Source::Standalone);
        assert!(matches!(
            frame.post_message(&msg, "http://localhost:3838"),
            Err(SendError::OriginMismatch { .. })
        ));
    }

    #[test]
    fn navigate_publishes_address_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let frame = SocketFrame::new(&config(dir.path()), &state).unwrap();
        assert_eq!(frame.location().as_deref(), Some("http://127.0.0.1:3838/"));

        frame
            .navigate("http://127.0.0.1:3838/?dark_mode=1&dm_sync=7")
            .unwrap();
        assert_eq!(
            frame.location().as_deref(),
            Some("http://127.0.0.1:3838/?dark_mode=1&dm_sync=7")
        );
        let written = std::fs::read_to_string(frame.address_file()).unwrap();
        assert_eq!(written.trim(), "http://127.0.0.1:3838/?dark_mode=1&dm_sync=7");
    }
}
