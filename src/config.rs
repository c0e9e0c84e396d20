use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from supervisor.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub paths: PathsConfig,
    pub interpreter: InterpreterConfig,
    pub monitor: MonitorConfig,
    pub stop: StopConfig,
    pub bundle: BundleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PathsConfig {
    /// Root of the per-user application data (default: platform data dir).
    pub data_dir: Option<PathBuf>,
    /// Log file the worker appends to (default: `<data_dir>/last_run.log`).
    pub log_file: Option<PathBuf>,
    /// PID file the worker writes at startup (default: `<data_dir>/runner_pid.txt`).
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Explicit interpreter executable; used as-is when it exists.
    pub path: Option<PathBuf>,
    /// Explicit interpreter command (e.g. "py -3"); validated by a version probe.
    pub command: Option<String>,
    /// Prefix the version probe output must start with.
    pub version_marker: String,
    /// Candidate commands tried in order. Empty means platform defaults.
    pub candidates: Vec<String>,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub tail_bytes: u64,
    /// How long `Stopping` may last before the stop is reported as indeterminate.
    /// Zero waits forever.
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub grace_ms: u64,
    pub poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Directory holding a fresh copy of the worker bundle to install from.
    pub source_dir: Option<PathBuf>,
    pub script_name: String,
    pub package_name: String,
}

// --- Default implementations ---

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            path: None,
            command: None,
            version_marker: "Python 3".to_string(),
            candidates: Vec::new(),
            probe_timeout_secs: 5,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            tail_bytes: 64 * 1024,
            stop_timeout_secs: 120,
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2000,
            poll_ms: 100,
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            script_name: "stmpo_local_render.py".to_string(),
            package_name: "stmpo".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        (self.stop_timeout_secs > 0).then(|| Duration::from_secs(self.stop_timeout_secs))
    }
}

impl StopConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

/// Errors from loading supervisor.toml.
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
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
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

impl SupervisorConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load config from `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
