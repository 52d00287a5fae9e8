use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var naming the ready marker the hook deletes at exit.
pub const READY_FILE_VAR: &str = "READY_FILE_PATH";
/// Env var naming the done marker the hook waits on.
pub const DONE_FILE_VAR: &str = "DONE_FILE_PATH";
/// Older names still honoured when the primary vars are unset.
pub const LEGACY_READY_FILE_VAR: &str = "LEAK_READY_FILE";
pub const LEGACY_DONE_FILE_VAR: &str = "LEAK_DONE_FILE";
/// Feature flag: the handshake is a no-op unless this is truthy.
pub const ENABLED_VAR: &str = "EXIT_HANDSHAKE_ENABLED";
pub const POLL_MS_VAR: &str = "EXIT_HANDSHAKE_POLL_MS";
pub const MAX_WAIT_MS_VAR: &str = "EXIT_HANDSHAKE_MAX_WAIT_MS";

/// Interval between done-marker checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hook-side configuration, sourced once from the environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub enabled: bool,
    pub ready_file: Option<PathBuf>,
    pub done_file: Option<PathBuf>,
    pub poll_interval: Duration,
    /// `None` waits for the done marker indefinitely.
    pub max_wait: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ready_file: None,
            done_file: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

impl HandshakeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset. Marker paths are taken as raw OS
    /// strings; flag and numeric values must be UTF-8, and numeric values that
    /// fail to parse fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.to_string_lossy().trim().is_empty());
        let get_str = |key: &str| {
            get(key).and_then(|v| match v.into_string() {
                Ok(s) => Some(s),
                Err(raw) => {
                    tracing::warn!(key, value = ?raw, "ignoring non-UTF-8 value");
                    None
                }
            })
        };

        let enabled = get_str(ENABLED_VAR).map(|v| parse_flag(&v)).unwrap_or(false);
        let ready_file = get(READY_FILE_VAR)
            .or_else(|| get(LEGACY_READY_FILE_VAR))
            .map(PathBuf::from);
        let done_file = get(DONE_FILE_VAR)
            .or_else(|| get(LEGACY_DONE_FILE_VAR))
            .map(PathBuf::from);
        let poll_interval = get_str(POLL_MS_VAR)
            .and_then(|v| parse_millis(POLL_MS_VAR, &v))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let max_wait = get_str(MAX_WAIT_MS_VAR).and_then(|v| parse_millis(MAX_WAIT_MS_VAR, &v));

        Self {
            enabled,
            ready_file,
            done_file,
            poll_interval,
            max_wait,
        }
    }

    /// Enable or disable the handshake.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Point the handshake at explicit marker paths.
    pub fn with_markers(mut self, ready: impl Into<PathBuf>, done: impl Into<PathBuf>) -> Self {
        self.ready_file = Some(ready.into());
        self.done_file = Some(done.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_millis(key: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(key, value, error = %e, "ignoring unparseable duration");
            None
        }
    }
}

/// Harness configuration loaded from harness.toml.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub markers: MarkersConfig,
    pub inspector: InspectorConfig,
    pub timeouts: TimeoutsConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MarkersConfig {
    /// Directory for the marker files. A fresh temp directory when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    pub exit_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReportConfig {
    pub path: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            command: "leaks".to_string(),
            args: vec!["{pid}".to_string()],
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            ready_timeout_secs: 300,
            exit_timeout_secs: 30,
        }
    }
}

impl TimeoutsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }
}

/// Errors from loading harness.toml.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl HarnessConfig {
    /// Load the config at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no harness config, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}
