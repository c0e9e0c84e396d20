use crate::config::{BundleConfig, PathsConfig};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Name of the application directory under the platform data dir.
const APP_DIR: &str = "render-supervisor";

/// Manages the per-user data directory layout.
///
/// The installed worker bundle, the worker's log and PID files, the launch
/// wrapper and the status file all live under a single root. Log and PID
/// paths can be overridden individually from `[paths]`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    log_file: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    script_name: String,
    package_name: String,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path with default file names.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let bundle = BundleConfig::default();
        Self {
            root: root.into(),
            log_file: None,
            pid_file: None,
            script_name: bundle.script_name,
            package_name: bundle.package_name,
        }
    }

    /// Build the layout from config, resolving the default root when unset.
    pub fn from_config(paths: &PathsConfig, bundle: &BundleConfig) -> Self {
        let root = paths.data_dir.clone().unwrap_or_else(default_root);
        Self {
            root,
            log_file: paths.log_file.clone(),
            pid_file: paths.pid_file.clone(),
            script_name: bundle.script_name.clone(),
            package_name: bundle.package_name.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the worker bundle is installed into.
    pub fn bundle_dir(&self) -> PathBuf {
        self.root.join("bundle")
    }

    /// Installed worker entry script.
    pub fn script(&self) -> PathBuf {
        self.bundle_dir().join(&self.script_name)
    }

    /// Installed worker support package directory.
    pub fn package_dir(&self) -> PathBuf {
        self.bundle_dir().join(&self.package_name)
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.root.join("last_run.log"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.root.join("runner_pid.txt"))
    }

    /// Stop-sequence log, kept next to the PID file.
    pub fn stop_log(&self) -> PathBuf {
        let pid_file = self.pid_file();
        pid_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("stop.log")
    }

    /// Side file some workers keep with their child PIDs.
    pub fn children_pid_file(&self) -> PathBuf {
        self.pid_file().with_file_name("children_pids.txt")
    }

    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Fixed location of the generated launch wrapper script.
    pub fn wrapper_script(&self) -> PathBuf {
        self.root.join("launch_render.cmd")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Create the root and bundle directories.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.bundle_dir())?;
        if let Some(parent) = self.log_file().parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.pid_file().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(created)
    }
}

/// Platform per-user application data root.
pub fn default_root() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Exclusive lock held for the lifetime of a supervised run session.
///
/// Only one session may monitor a given data directory at a time.
#[derive(Debug)]
pub struct SessionLock {
    _file: File,
}

impl SessionLock {
    /// Try to take the lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.try_lock_exclusive().map_err(|_| LockError::Held {
            path: path.to_path_buf(),
        })?;

        use std::io::Write;
        let mut file = file;
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { _file: file })
    }
}

/// Errors from acquiring the session lock.
#[derive(Debug)]
pub enum LockError {
    Held { path: PathBuf },
    Io { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held { path } => write!(
                f,
                "another run session is already supervised from this data dir (lock {})",
                path.display()
            ),
            LockError::Io { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Held { .. } => None,
            LockError::Io { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let dd = DataDir::new("/tmp/rs");
        assert_eq!(dd.bundle_dir(), PathBuf::from("/tmp/rs/bundle"));
        assert_eq!(
            dd.script(),
            PathBuf::from("/tmp/rs/bundle/stmpo_local_render.py")
        );
        assert_eq!(dd.package_dir(), PathBuf::from("/tmp/rs/bundle/stmpo"));
        assert_eq!(dd.log_file(), PathBuf::from("/tmp/rs/last_run.log"));
        assert_eq!(dd.pid_file(), PathBuf::from("/tmp/rs/runner_pid.txt"));
        assert_eq!(dd.stop_log(), PathBuf::from("/tmp/rs/stop.log"));
        assert_eq!(dd.status(), PathBuf::from("/tmp/rs/status.json"));
    }

    #[test]
    fn test_overrides_from_config() {
        let paths = PathsConfig {
            data_dir: Some(PathBuf::from("/data")),
            log_file: Some(PathBuf::from("/logs/run.log")),
            pid_file: Some(PathBuf::from("/run/worker/pid")),
        };
        let dd = DataDir::from_config(&paths, &BundleConfig::default());
        assert_eq!(dd.root(), Path::new("/data"));
        assert_eq!(dd.log_file(), PathBuf::from("/logs/run.log"));
        assert_eq!(dd.pid_file(), PathBuf::from("/run/worker/pid"));
        assert_eq!(dd.stop_log(), PathBuf::from("/run/worker/stop.log"));
    }

    #[test]
    fn test_init_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join("app"));
        assert!(dd.init().unwrap());
        assert!(dd.bundle_dir().is_dir());
        assert!(!dd.init().unwrap());
    }

    #[test]
    fn test_session_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");
        let first = SessionLock::acquire(&path).unwrap();
        let second = SessionLock::acquire(&path);
        assert!(matches!(second, Err(LockError::Held { .. })));
        drop(first);
        assert!(SessionLock::acquire(&path).is_ok());
    }
}
