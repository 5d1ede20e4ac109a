use tokio::sync::watch;

/// How the host selects its display mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThemeMode {
    Dark,
    Light,
    /// No forced preference; follow the desktop / system theme.
    #[default]
    Auto,
}

impl ThemeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "dark" => Some(ThemeMode::Dark),
            "light" => Some(ThemeMode::Light),
            "auto" | "system" => Some(ThemeMode::Auto),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ThemeMode::Dark => "dark",
            ThemeMode::Light => "light",
            ThemeMode::Auto => "auto",
        }
    }

    fn explicit(self) -> Option<bool> {
        match self {
            ThemeMode::Dark => Some(true),
            ThemeMode::Light => Some(false),
            ThemeMode::Auto => None,
        }
    }
}

/// Raw inputs to mode resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Preference {
    /// Explicitly forced by the user, if any.
    pub explicit: Option<bool>,
    /// Ambient system preference, if it could be detected.
    pub system: Option<bool>,
}

impl Preference {
    /// Forced preference wins over the system one; neither means light.
    pub fn resolve(&self) -> bool {
        self.explicit.or(self.system).unwrap_or(false)
    }
}

/// Anything that can report the host's current display mode.
pub trait ModeSource: Send + Sync {
    /// The resolved flag, `true` = dark. Recomputed on every call.
    fn resolve(&self) -> bool;

    /// Receiver notified whenever the resolved flag changes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// The host's colour scheme: explicit choice plus detected system preference.
pub struct ColorScheme {
    preference: watch::Sender<Preference>,
    resolved: watch::Sender<bool>,
}

impl ColorScheme {
    pub fn new(preference: Preference) -> Self {
        let (preference_tx, _) = watch::channel(preference);
        let (resolved_tx, _) = watch::channel(preference.resolve());
        Self {
            preference: preference_tx,
            resolved: resolved_tx,
        }
    }

    /// Scheme with the given mode and a freshly probed system preference.
    pub fn detect(mode: ThemeMode) -> Self {
        Self::new(Preference {
            explicit: mode.explicit(),
            system: detect_system_dark(),
        })
    }

    pub fn preference(&self) -> Preference {
        *self.preference.borrow()
    }

    /// The explicit choice, as a mode.
    pub fn mode(&self) -> ThemeMode {
        match self.preference().explicit {
            Some(true) => ThemeMode::Dark,
            Some(false) => ThemeMode::Light,
            None => ThemeMode::Auto,
        }
    }

    pub fn set_mode(&self, mode: ThemeMode) {
        self.update(|p| p.explicit = mode.explicit());
    }

    /// Flip the appearance by forcing the opposite of what is shown now.
    pub fn toggle(&self) {
        self.update(|p| p.explicit = Some(!p.resolve()));
    }

    pub fn set_system(&self, system: Option<bool>) {
        self.update(|p| p.system = system);
    }

    /// Re-probe the desktop. Returns true if the resolved flag changed.
    pub fn refresh_system(&self) -> bool {
        let before = self.resolve();
        self.set_system(detect_system_dark());
        before != self.resolve()
    }

    fn update(&self, f: impl FnOnce(&mut Preference)) {
        self.preference.send_modify(f);
        let dark = self.preference().resolve();
        self.resolved.send_if_modified(|current| {
            if *current == dark {
                false
            } else {
                *current = dark;
                tracing::info!(dark, "resolved display mode changed");
                true
            }
        });
    }
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self::new(Preference::default())
    }
}

impl ModeSource for ColorScheme {
    fn resolve(&self) -> bool {
        self.preference().resolve()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.resolved.subscribe()
    }
}

/// Detect the system dark preference via the desktop detection cascade.
/// Spawns CLI tools synchronously; keep it off hot paths.
/// Returns `None` when nothing answers.
pub fn detect_system_dark() -> Option<bool> {
    // 1. COSMIC DE: read the is_dark file directly
    if let Some(home) = dirs::home_dir() {
        let cosmic_path = home.join(".config/cosmic/com.system76.CosmicTheme.Mode/v1/is_dark");
        if let Ok(contents) = std::fs::read_to_string(&cosmic_path) {
            if let Some(dark) = parse_cosmic(&contents) {
                return Some(dark);
            }
        }
    }

    // 2. XDG Desktop Portal (COSMIC, GNOME 42+, KDE 5.24+)
    if let Ok(output) = std::process::Command::new("dbus-send")
        .args([
            "--session",
            "--print-reply=literal",
            "--dest=org.freedesktop.portal.Desktop",
            "/org/freedesktop/portal/desktop",
            "org.freedesktop.portal.Settings.ReadOne",
            "string:org.freedesktop.appearance",
            "string:color-scheme",
        ])
        .output()
    {
        if output.status.success() {
            if let Some(dark) = parse_portal(&String::from_utf8_lossy(&output.stdout)) {
                return Some(dark);
            }
        }
    }

    // 3. gsettings color-scheme (GNOME 42+)
    if let Ok(output) = std::process::Command::new("gsettings")
        .args(["get", "org.gnome.desktop.interface", "color-scheme"])
        .output()
    {
        if let Some(dark) = parse_color_scheme(&String::from_utf8_lossy(&output.stdout)) {
            return Some(dark);
        }
    }

    // 4. gsettings gtk-theme name (older GNOME)
    if let Ok(output) = std::process::Command::new("gsettings")
        .args(["get", "org.gnome.desktop.interface", "gtk-theme"])
        .output()
    {
        if output.status.success() {
            if let Some(dark) = parse_theme_name(&String::from_utf8_lossy(&output.stdout)) {
                return Some(dark);
            }
        }
    }

    // 5. GTK_THEME env var (e.g. "Adwaita:dark")
    if let Ok(val) = std::env::var("GTK_THEME") {
        return parse_theme_name(&val);
    }

    None
}

fn parse_cosmic(contents: &str) -> Option<bool> {
    match contents.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// color-scheme: 0=no preference, 1=dark, 2=light
fn parse_portal(stdout: &str) -> Option<bool> {
    if stdout.contains("uint32 1") {
        Some(true)
    } else if stdout.contains("uint32 2") {
        Some(false)
    } else {
        None
    }
}

fn parse_color_scheme(stdout: &str) -> Option<bool> {
    if stdout.contains("prefer-dark") {
        Some(true)
    } else if stdout.contains("prefer-light") || stdout.contains("default") {
        Some(false)
    } else {
        None
    }
}

fn parse_theme_name(name: &str) -> Option<bool> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        None
    } else {
        Some(name.contains("dark"))
    }
}
