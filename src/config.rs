use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::SyncError;
use crate::sync::SyncOptions;
use crate::theme::ThemeMode;

pub const DEFAULT_SUBORDINATE_URL: &str = "http://127.0.0.1:3838";

/// Daemon configuration, taken from the environment.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Base address of the subordinate app; frames default to it.
    pub subordinate_url: String,
    pub theme: ThemeMode,
    pub load_delay: Duration,
    pub debounce: Duration,
    /// Skip the registry and run every frame standalone.
    pub standalone: bool,
    pub frames_file: PathBuf,
    pub store_file: Option<PathBuf>,
}

impl HostConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let subordinate_url = lookup("MODESYNC_SUBORDINATE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUBORDINATE_URL.to_string());
        origin_of(&subordinate_url)?;

        let theme = match lookup("MODESYNC_THEME") {
            Some(v) => ThemeMode::parse(&v)
                .ok_or_else(|| SyncError::Config(format!("unknown MODESYNC_THEME {v:?}")))?,
            None => ThemeMode::Auto,
        };
        let defaults = SyncOptions::default();
        let load_delay = millis(&lookup, "MODESYNC_LOAD_DELAY_MS")?.unwrap_or(defaults.load_delay);
        let debounce = millis(&lookup, "MODESYNC_DEBOUNCE_MS")?.unwrap_or(defaults.debounce);
        let standalone = matches!(
            lookup("MODESYNC_STANDALONE").as_deref().map(str::trim),
            Some("1" | "true" | "yes")
        );
        let frames_file = lookup("MODESYNC_FRAMES")
            .map(PathBuf::from)
            .unwrap_or_else(frames_file_path);
        let store_file = lookup("MODESYNC_STORE")
            .map(PathBuf::from)
            .or_else(crate::store::default_store_path);

        Ok(Self {
            subordinate_url,
            theme,
            load_delay,
            debounce,
            standalone,
            frames_file,
            store_file,
        })
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            load_delay: self.load_delay,
            debounce: self.debounce,
            use_registry: !self.standalone,
            ..SyncOptions::default()
        }
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, SyncError> {
    match lookup(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| SyncError::Config(format!("{key}={v:?}: {e}"))),
    }
}

/// Serialised origin (`scheme://host[:port]`) of an address.
pub fn origin_of(address: &str) -> Result<String, SyncError> {
    let url = Url::parse(address).map_err(|source| SyncError::Url {
        url: address.to_string(),
        source,
    })?;
    Ok(url.origin().ascii_serialization())
}

/// One embedded subordinate managed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    pub label: String,
    /// Initial address of the subordinate.
    pub url: String,
    /// Trusted origin; defaults to the origin of `url`.
    pub origin: String,
    /// Socket the subordinate listens on for messages.
    pub socket: PathBuf,
}

/// What changed between two frame lists.
pub struct FrameDiff {
    pub added: Vec<FrameConfig>,
    pub removed: Vec<String>,
    /// Same label, different url/origin/socket (unmount old, mount new).
    pub changed: Vec<FrameConfig>,
}

/// Return the path to the frames file.
pub fn frames_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("modesync/frames.md")
}

/// Directory holding per-frame sockets and address files.
pub fn runtime_dir() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime_dir).join("modesync")
}

/// Parse the frames file.
///
/// Format:
/// ```markdown
/// # analysis
/// - url: http://127.0.0.1:3838/nonparametric/
/// - origin: http://127.0.0.1:3838
/// - socket: /run/user/1000/modesync/analysis.sock
/// ```
///
/// Only `# heading` is required. `url` defaults to `default_url`, `origin`
/// to the origin of `url`, `socket` to `<runtime dir>/<label>.sock`.
/// Frames whose address cannot be parsed are skipped.
pub fn parse_frames(content: &str, default_url: &str) -> Vec<FrameConfig> {
    struct Pending {
        label: String,
        url: Option<String>,
        origin: Option<String>,
        socket: Option<PathBuf>,
    }

    fn finish(p: Pending, default_url: &str, out: &mut Vec<FrameConfig>) {
        let url = p.url.unwrap_or_else(|| default_url.to_string());
        let origin = match p.origin {
            Some(o) => o,
            None => match origin_of(&url) {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(label = %p.label, "skipping frame: {e}");
                    return;
                }
            },
        };
        let socket = p
            .socket
            .unwrap_or_else(|| runtime_dir().join(format!("{}.sock", p.label)));
        out.push(FrameConfig {
            label: p.label,
            url,
            origin,
            socket,
        });
    }

    let mut frames = Vec::new();
    let mut current: Option<Pending> = None;

    for line in content.lines() {
        let trimmed = line.trim();

        if let Some(heading) = trimmed.strip_prefix("# ") {
            if let Some(prev) = current.take() {
                finish(prev, default_url, &mut frames);
            }
            current = Some(Pending {
                label: heading.trim().to_string(),
                url: None,
                origin: None,
                socket: None,
            });
            continue;
        }

        let Some(pending) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = trimmed.strip_prefix("- url:") {
            let v = rest.trim();
            if !v.is_empty() {
                pending.url = Some(v.to_string());
            }
        } else if let Some(rest) = trimmed.strip_prefix("- origin:") {
            let v = rest.trim();
            if !v.is_empty() {
                pending.origin = Some(v.to_string());
            }
        } else if let Some(rest) = trimmed.strip_prefix("- socket:") {
            let v = rest.trim();
            if !v.is_empty() {
                pending.socket = Some(PathBuf::from(v));
            }
        }
    }

    if let Some(last) = current {
        finish(last, default_url, &mut frames);
    }

    frames
}

/// Compute the diff between old and new frame lists, matched by label.
pub fn reconcile(old: &[FrameConfig], new: &[FrameConfig]) -> FrameDiff {
    let old_map: HashMap<&str, &FrameConfig> = old.iter().map(|c| (c.label.as_str(), c)).collect();
    let new_map: HashMap<&str, &FrameConfig> = new.iter().map(|c| (c.label.as_str(), c)).collect();

    let mut added = Vec::new();
    let mut changed = Vec::new();
    for cfg in new {
        match old_map.get(cfg.label.as_str()) {
            None => added.push(cfg.clone()),
            Some(prev) if *prev != cfg => changed.push(cfg.clone()),
            Some(_) => {}
        }
    }

    let removed = old
        .iter()
        .filter(|c| !new_map.contains_key(c.label.as_str()))
        .map(|c| c.label.clone())
        .collect();

    FrameDiff {
        added,
        removed,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = HostConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(cfg.subordinate_url, DEFAULT_SUBORDINATE_URL);
        assert_eq!(cfg.theme, ThemeMode::Auto);
        assert_eq!(cfg.load_delay, Duration::from_millis(500));
        assert_eq!(cfg.debounce, Duration::from_millis(1000));
        assert!(!cfg.standalone);
        assert!(cfg.sync_options().use_registry);
    }

    #[test]
    fn environment_overrides() {
        let cfg = HostConfig::from_lookup(env(&[
            ("MODESYNC_SUBORDINATE_URL", "https://shiny.example:8443/app"),
            ("MODESYNC_THEME", "dark"),
            ("MODESYNC_LOAD_DELAY_MS", "250"),
            ("MODESYNC_DEBOUNCE_MS", "50"),
            ("MODESYNC_STANDALONE", "true"),
            ("MODESYNC_FRAMES", "/etc/modesync/frames.md"),
            ("MODESYNC_STORE", "/var/lib/modesync/store.json"),
        ]))
        .unwrap();
        assert_eq!(cfg.theme, ThemeMode::Dark);
        assert_eq!(cfg.load_delay, Duration::from_millis(250));
        let opts = cfg.sync_options();
        assert_eq!(opts.debounce, Duration::from_millis(50));
        assert!(!opts.use_registry);
        assert_eq!(cfg.frames_file, PathBuf::from("/etc/modesync/frames.md"));
        assert_eq!(
            cfg.store_file,
            Some(PathBuf::from("/var/lib/modesync/store.json"))
        );
    }

    #[test]
    fn bad_values_are_config_errors() {
        assert!(matches!(
            HostConfig::from_lookup(env(&[("MODESYNC_THEME", "sepia")])),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            HostConfig::from_lookup(env(&[("MODESYNC_DEBOUNCE_MS", "soon")])),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            HostConfig::from_lookup(env(&[("MODESYNC_SUBORDINATE_URL", "::nope")])),
            Err(SyncError::Url { .. })
        ));
    }

    #[test]
    fn origin_strips_path_and_keeps_port() {
        assert_eq!(
            origin_of("http://127.0.0.1:3838/app/?x=1").unwrap(),
            "http://127.0.0.1:3838"
        );
        assert_eq!(origin_of("https://sub.example/").unwrap(), "https://sub.example");
    }

    #[test]
    fn parse_basic_frames() {
        let input = r#"
# analysis
- url: http://127.0.0.1:3838/nonparametric/
- socket: /tmp/analysis.sock

# report
- url: https://reports.example/r/
- origin: https://reports.example
"#;
        let frames = parse_frames(input, DEFAULT_SUBORDINATE_URL);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].label, "analysis");
        assert_eq!(frames[0].origin, "http://127.0.0.1:3838");
        assert_eq!(frames[0].socket, PathBuf::from("/tmp/analysis.sock"));
        assert_eq!(frames[1].url, "https://reports.example/r/");
        assert_eq!(frames[1].origin, "https://reports.example");
        assert!(frames[1].socket.ends_with("report.sock"));
    }

    #[test]
    fn parse_defaults_url_and_skips_bad_address() {
        let input = r#"
# plain

# broken
- url: not a url
"#;
        let frames = parse_frames(input, DEFAULT_SUBORDINATE_URL);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].label, "plain");
        assert_eq!(frames[0].url, DEFAULT_SUBORDINATE_URL);
        assert_eq!(frames[0].origin, "http://127.0.0.1:3838");
    }

    #[test]
    fn lines_before_first_heading_ignored() {
        let frames = parse_frames("- url: http://x/\n", DEFAULT_SUBORDINATE_URL);
        assert!(frames.is_empty());
    }

    #[test]
    fn reconcile_detects_changes() {
        let frame = |label: &str, url: &str| FrameConfig {
            label: label.into(),
            url: url.into(),
            origin: "http://h".into(),
            socket: PathBuf::from(format!("/tmp/{label}.sock")),
        };
        let old = vec![frame("a", "http://h/a"), frame("b", "http://h/b")];
        let new = vec![frame("a", "http://h/a2"), frame("c", "http://h/c")];
        let diff = reconcile(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].label, "c");
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].label, "a");
    }
}
