use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use modesync::bus::MessageBus;
use modesync::channel::ChannelAdapter;
use modesync::config::{self, FrameConfig, HostConfig};
use modesync::error::SyncError;
use modesync::frame::SocketFrame;
use modesync::ipc::{self, Command, Request};
use modesync::message::InboundEvent;
use modesync::registry::ModeRegistry;
use modesync::store::{FileStore, KeyValueStore, MemoryStore};
use modesync::subordinate::SubordinateHandle;
use modesync::sync::{HostContext, Synchronizer};
use modesync::theme::{self, ColorScheme, ModeSource, ThemeMode};

const THEME_REFRESH: Duration = Duration::from_secs(5);
const FRAMES_CHECK: Duration = Duration::from_secs(2);

struct Daemon {
    config: HostConfig,
    scheme: Arc<ColorScheme>,
    registry: Option<ModeRegistry>,
    host: HostContext,
    frames: Vec<FrameConfig>,
    /// `None` until the frames file has been looked at once.
    frames_mtime: Option<Option<SystemTime>>,
    mounted: HashMap<String, Synchronizer>,
}

impl Daemon {
    fn new(config: HostConfig) -> Self {
        let scheme = Arc::new(ColorScheme::detect(config.theme));
        let store: Arc<dyn KeyValueStore> = match &config.store_file {
            Some(path) => Arc::new(FileStore::new(path)),
            None => {
                tracing::warn!("no data directory, persisted mode kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        let adapter = Arc::new(ChannelAdapter::new(store));
        let bus = MessageBus::new();
        let (registry, host) = if config.standalone {
            (
                None,
                HostContext::standalone(scheme.clone(), adapter, bus),
            )
        } else {
            let registry = ModeRegistry::start(scheme.clone(), adapter);
            (Some(registry.clone()), HostContext::with_registry(registry, bus))
        };
        tracing::info!(
            mode = scheme.mode().label(),
            dark = scheme.resolve(),
            registry = registry.is_some(),
            "host ready"
        );
        Self {
            config,
            scheme,
            registry,
            host,
            frames: Vec::new(),
            frames_mtime: None,
            mounted: HashMap::new(),
        }
    }

    fn mount(&mut self, cfg: &FrameConfig) {
        let frame = match SocketFrame::new(cfg, &config::runtime_dir()) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                tracing::warn!(label = %cfg.label, "cannot start frame writer: {e}");
                return;
            }
        };
        let handle = SubordinateHandle::new(frame, cfg.origin.as_str());
        let sync = Synchronizer::mount(handle, &self.host, self.config.sync_options());
        tracing::info!(
            label = %cfg.label,
            origin = %cfg.origin,
            state = ?sync.state(),
            "mounted frame"
        );
        self.mounted.insert(cfg.label.clone(), sync);
    }

    fn unmount(&mut self, label: &str) {
        if let Some(sync) = self.mounted.remove(label) {
            sync.unmount();
            tracing::info!(label, "unmounted frame");
        }
    }

    fn reload_frames_if_changed(&mut self) {
        let mtime = std::fs::metadata(&self.config.frames_file)
            .and_then(|m| m.modified())
            .ok();
        if !frames_stale(self.frames_mtime, mtime) {
            return;
        }
        self.frames_mtime = Some(mtime);
        self.reload_frames();
    }

    fn reload_frames(&mut self) {
        let content = match std::fs::read_to_string(&self.config.frames_file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                let path = self.config.frames_file.display();
                tracing::warn!(%path, "cannot read frames file: {e}");
                return;
            }
        };
        let next = config::parse_frames(&content, &self.config.subordinate_url);
        let diff = config::reconcile(&self.frames, &next);
        for label in &diff.removed {
            self.unmount(label);
        }
        for cfg in &diff.changed {
            self.unmount(&cfg.label);
            self.mount(cfg);
        }
        for cfg in &diff.added {
            self.mount(cfg);
        }
        self.frames = next;
    }

    async fn refresh_theme(&self) {
        if self.scheme.mode() != ThemeMode::Auto {
            return;
        }
        match tokio::task::spawn_blocking(theme::detect_system_dark).await {
            Ok(system) => self.scheme.set_system(system),
            Err(e) => tracing::warn!("system theme probe failed: {e}"),
        }
    }

    fn handle(&mut self, request: Request) {
        let reply = self.execute(request.command);
        let _ = request.reply.send(reply);
    }

    fn execute(&mut self, command: Command) -> String {
        match command {
            Command::Theme(mode) => {
                self.scheme.set_mode(mode);
                format!("ok theme {} ({})", mode.label(), mode_word(self.scheme.resolve()))
            }
            Command::ThemeToggle => {
                self.scheme.toggle();
                format!("ok {}", mode_word(self.scheme.resolve()))
            }
            Command::Loaded(label) => match self.mounted.get(&label) {
                Some(sync) => {
                    sync.on_load();
                    "ok".to_string()
                }
                None => format!("error: no frame {label:?}"),
            },
            Command::Ready(label) => match self.mounted.get(&label) {
                Some(sync) => {
                    let event = InboundEvent::ready(sync.handle().origin());
                    let listeners = self.host.bus.publish(event);
                    format!("ok {listeners} listener(s)")
                }
                None => format!("error: no frame {label:?}"),
            },
            Command::Message(event) => {
                let listeners = self.host.bus.publish(event);
                format!("ok {listeners} listener(s)")
            }
            Command::Status => self.status_line(),
        }
    }

    fn status_line(&self) -> String {
        let mut labels: Vec<&String> = self.mounted.keys().collect();
        labels.sort();
        let frames: Vec<serde_json::Value> = labels
            .into_iter()
            .map(|label| {
                serde_json::json!({
                    "label": label,
                    "status": self.mounted[label].status(),
                })
            })
            .collect();
        let status = serde_json::json!({
            "mode": self.scheme.mode().label(),
            "dark": self.scheme.resolve(),
            "registry": self.registry.as_ref().map(|r| r.len()),
            "frames": frames,
        });
        status.to_string()
    }

    fn shutdown(&mut self) {
        for (_, sync) in self.mounted.drain() {
            sync.unmount();
        }
        if let Some(registry) = &self.registry {
            registry.shutdown();
        }
    }
}

/// A missing file counts as a state too: it is read once, then again only
/// after it appears.
fn frames_stale(seen: Option<Option<SystemTime>>, current: Option<SystemTime>) -> bool {
    seen != Some(current)
}

fn mode_word(dark: bool) -> &'static str {
    if dark { "dark" } else { "light" }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modesync=info")),
        )
        .init();
    tracing::info!(
        version = env!("MODESYNC_VERSION"),
        commit = env!("MODESYNC_COMMIT"),
        "starting"
    );

    let config = HostConfig::from_env()?;
    let socket = ipc::socket_path();
    let mut daemon = Daemon::new(config);
    daemon.reload_frames_if_changed();

    let mut requests = ipc::socket_listener(&socket)?;
    let mut theme_tick = tokio::time::interval(THEME_REFRESH);
    let mut frames_tick = tokio::time::interval(FRAMES_CHECK);

    loop {
        tokio::select! {
            request = requests.next() => match request {
                Some(request) => daemon.handle(request),
                None => break,
            },
            _ = theme_tick.tick() => daemon.refresh_theme().await,
            _ = frames_tick.tick() => daemon.reload_frames_if_changed(),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    daemon.shutdown();
    let _ = std::fs::remove_file(&socket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_file_reloads_only_on_change() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let t1 = t0 + Duration::from_secs(1);

        assert!(frames_stale(None, None));
        assert!(frames_stale(None, Some(t0)));

        // Missing file: checked once, not re-read every tick.
        assert!(!frames_stale(Some(None), None));
        assert!(frames_stale(Some(None), Some(t0)));

        assert!(!frames_stale(Some(Some(t0)), Some(t0)));
        assert!(frames_stale(Some(Some(t0)), Some(t1)));
        assert!(frames_stale(Some(Some(t0)), None));
    }
}
