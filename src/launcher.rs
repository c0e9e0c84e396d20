/// Process Launcher: clears stale run state and invokes a detached launch plan.
///
/// The plan self-detaches, so the synchronous call here returns as soon as
/// the shell (or `start`) has handed the job off.
use crate::command::LaunchPlan;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// What the launcher observed at launch time.
#[derive(Debug, Clone)]
pub struct LaunchReceipt {
    /// Log length before the launch; records before this offset belong to earlier runs.
    pub log_baseline: u64,
    /// Wall-clock time the launch was issued.
    pub launched_at: chrono::DateTime<chrono::Utc>,
}

/// Errors that can occur while launching.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to remove a stale PID file.
    PidFileCleanup {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to write the generated wrapper script.
    WrapperWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The detached-start call itself failed.
    LaunchFailed {
        command: String,
        reason: String,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::PidFileCleanup { path, source } => {
                write!(f, "failed to remove stale PID file {}: {source}", path.display())
            }
            LaunchError::WrapperWrite { path, source } => {
                write!(f, "failed to write launch wrapper {}: {source}", path.display())
            }
            LaunchError::LaunchFailed { command, reason } => {
                write!(f, "failed to launch render job ({command}): {reason}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::PidFileCleanup { source, .. } => Some(source),
            LaunchError::WrapperWrite { source, .. } => Some(source),
            LaunchError::LaunchFailed { .. } => None,
        }
    }
}

/// Delete the PID file if present. A missing file is not an error.
pub fn clear_pid_file(pid_file: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(pid_file) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Current length of the log, 0 if it does not exist yet.
pub fn log_length(log_file: &Path) -> u64 {
    std::fs::metadata(log_file).map(|m| m.len()).unwrap_or(0)
}

/// Launch the plan detached.
pub fn launch(
    plan: &LaunchPlan,
    pid_file: &Path,
    log_file: &Path,
) -> Result<LaunchReceipt, LaunchError> {
    if clear_pid_file(pid_file).map_err(|e| LaunchError::PidFileCleanup {
        path: pid_file.to_path_buf(),
        source: e,
    })? {
        tracing::info!(path = %pid_file.display(), "removed stale PID file");
    }

    if let Some(wrapper) = &plan.wrapper {
        if let Some(parent) = wrapper.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LaunchError::WrapperWrite {
                path: wrapper.path.clone(),
                source: e,
            })?;
        }
        std::fs::write(&wrapper.path, wrapper.contents.as_bytes()).map_err(|e| {
            LaunchError::WrapperWrite {
                path: wrapper.path.clone(),
                source: e,
            }
        })?;
        tracing::debug!(path = %wrapper.path.display(), "wrote launch wrapper");
    }

    let log_baseline = log_length(log_file);
    let command = plan.display();
    tracing::info!(command = %command, log_baseline, "launching render job");

    let status = Command::new(&plan.program)
        .args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| LaunchError::LaunchFailed {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if !status.success() {
        return Err(LaunchError::LaunchFailed {
            command,
            reason: format!("launcher exited with {status}"),
        });
    }

    Ok(LaunchReceipt {
        log_baseline,
        launched_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(program: &str, args: &[&str]) -> LaunchPlan {
        LaunchPlan {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            wrapper: None,
        }
    }

    #[test]
    fn test_clear_pid_file_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!clear_pid_file(&dir.path().join("pid")).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_clears_stale_pid_and_records_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("runner_pid.txt");
        let log_file = dir.path().join("last_run.log");
        std::fs::write(&pid_file, "4242").unwrap();
        std::fs::write(&log_file, "old run line\n").unwrap();

        let receipt = launch(&plan("sh", &["-c", "true"]), &pid_file, &log_file).unwrap();
        assert!(!pid_file.exists());
        assert_eq!(receipt.log_baseline, 13);
    }

    #[cfg(unix)]
    #[test]
    fn test_detached_launch_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        launch(
            &plan("sh", &["-c", "nohup sleep 3 </dev/null >/dev/null 2>&1 &"]),
            &dir.path().join("pid"),
            &dir.path().join("log"),
        )
        .unwrap();
        assert!(started.elapsed().as_secs() < 2);
    }

    #[test]
    fn test_launch_failed_on_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let err = launch(
            &plan("nonexistent-launcher-xyz", &[]),
            &dir.path().join("pid"),
            &dir.path().join("log"),
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::LaunchFailed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_failed_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let err = launch(
            &plan("sh", &["-c", "exit 3"]),
            &dir.path().join("pid"),
            &dir.path().join("log"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to launch render job"));
    }

    #[test]
    fn test_wrapper_written_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper_path = dir.path().join("sub").join("launch_render.cmd");
        let mut p = plan("nonexistent-launcher-xyz", &[]);
        p.wrapper = Some(crate::command::WrapperScript {
            path: wrapper_path.clone(),
            contents: "@echo off\r\n".to_string(),
        });
        let _ = launch(&p, &dir.path().join("pid"), &dir.path().join("log"));
        assert_eq!(
            std::fs::read_to_string(&wrapper_path).unwrap(),
            "@echo off\r\n"
        );
    }
}
