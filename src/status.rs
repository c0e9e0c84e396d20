/// Status file: writes `status.json` with the run's state on every update,
/// so other processes (the CLI, a GUI host) can observe a session.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::progress::{ChildProgress, RunState, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The JSON payload written to `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    /// PID of the supervising host, not the render job.
    pub pid: u32,
    pub status: RunStatus,
    pub percent: f64,
    pub supervising_pid: Option<u32>,
    pub children: Vec<ChildProgress>,
    pub exit_code: Option<i32>,
    /// Log offset where this run's output starts.
    pub log_baseline: u64,
    pub launched_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

impl StatusData {
    /// Snapshot a run state.
    pub fn from_state(
        state: &RunState,
        log_baseline: u64,
        launched_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            status: state.status,
            percent: state.percent(),
            supervising_pid: state.supervising_pid,
            children: state.children.values().cloned().collect(),
            exit_code: state.exit_code,
            log_baseline,
            launched_at,
            last_update: Utc::now(),
        }
    }
}

/// Manages the status file lifecycle.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".status.json.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Write, logging instead of failing. Status is advisory.
    pub fn write_state(&self, state: &RunState, log_baseline: u64, launched_at: Option<DateTime<Utc>>) {
        let data = StatusData::from_state(state, log_baseline, launched_at);
        if let Err(e) = self.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Read the last written status, if any.
    pub fn read(&self) -> Result<Option<StatusData>, StatusError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StatusError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Parse { path, source } => {
                write!(f, "malformed status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Parse { source, .. } => Some(source),
        }
    }
}
