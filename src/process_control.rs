//! OS process signalling behind a trait so lifecycle logic can be tested
//! without touching real processes.
//!
//! Worker children run in their own session, so a PID that leads a process
//! group is signalled as a group (reaching the renderer's own children).
//! Anything else is signalled as a single process.

/// Errors from delivering a signal to one PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The process no longer exists.
    NoSuchProcess { pid: u32 },
    /// The process exists but we may not signal it.
    PermissionDenied { pid: u32 },
    /// The operation is not available on this platform.
    Unsupported { operation: &'static str },
    /// Any other failure.
    Failed { pid: u32, reason: String },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::NoSuchProcess { pid } => write!(f, "process {pid} does not exist"),
            SignalError::PermissionDenied { pid } => {
                write!(f, "not permitted to signal process {pid}")
            }
            SignalError::Unsupported { operation } => {
                write!(f, "{operation} is not supported on this platform")
            }
            SignalError::Failed { pid, reason } => write!(f, "signalling {pid} failed: {reason}"),
        }
    }
}

impl std::error::Error for SignalError {}

/// Suspend, resume and terminate OS processes by PID.
pub trait ProcessSignaller: Send + Sync {
    fn suspend(&self, pid: u32) -> Result<(), SignalError>;
    fn resume(&self, pid: u32) -> Result<(), SignalError>;
    /// Polite termination request.
    fn terminate(&self, pid: u32) -> Result<(), SignalError>;
    /// Forced termination.
    fn kill(&self, pid: u32) -> Result<(), SignalError>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// The signaller for the current platform.
pub fn platform_signaller() -> std::sync::Arc<dyn ProcessSignaller> {
    #[cfg(unix)]
    {
        std::sync::Arc::new(NixSignaller)
    }
    #[cfg(not(unix))]
    {
        std::sync::Arc::new(TaskkillSignaller)
    }
}

#[cfg(unix)]
pub use unix::NixSignaller;

#[cfg(unix)]
mod unix {
    use super::{ProcessSignaller, SignalError};
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    /// SIGSTOP / SIGCONT / SIGTERM / SIGKILL via nix.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NixSignaller;

    impl NixSignaller {
        fn send(&self, pid: u32, signal: Signal) -> Result<(), SignalError> {
            let raw = i32::try_from(pid).map_err(|_| SignalError::Failed {
                pid,
                reason: "pid out of range".to_string(),
            })?;
            if raw <= 1 {
                return Err(SignalError::Failed {
                    pid,
                    reason: "refusing to signal init or the whole session".to_string(),
                });
            }
            let target = Pid::from_raw(raw);
            // ESRCH from killpg only means `pid` does not lead a group.
            match killpg(target, signal) {
                Ok(()) => {
                    tracing::debug!(pid, signal = %signal, "signalled process group");
                    return Ok(());
                }
                Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!(pid, error = %e, "killpg failed, trying the single pid"),
            }
            kill(target, signal).map_err(|e| match e {
                Errno::ESRCH => SignalError::NoSuchProcess { pid },
                Errno::EPERM => SignalError::PermissionDenied { pid },
                other => SignalError::Failed {
                    pid,
                    reason: other.to_string(),
                },
            })?;
            tracing::debug!(pid, signal = %signal, "signalled process");
            Ok(())
        }
    }

    impl ProcessSignaller for NixSignaller {
        fn suspend(&self, pid: u32) -> Result<(), SignalError> {
            self.send(pid, Signal::SIGSTOP)
        }

        fn resume(&self, pid: u32) -> Result<(), SignalError> {
            self.send(pid, Signal::SIGCONT)
        }

        fn terminate(&self, pid: u32) -> Result<(), SignalError> {
            self.send(pid, Signal::SIGTERM)
        }

        fn kill(&self, pid: u32) -> Result<(), SignalError> {
            self.send(pid, Signal::SIGKILL)
        }

        fn is_alive(&self, pid: u32) -> bool {
            let Ok(raw) = i32::try_from(pid) else {
                return false;
            };
            if raw <= 0 {
                return false;
            }
            match kill(Pid::from_raw(raw), None) {
                Ok(()) => true,
                Err(Errno::EPERM) => true,
                Err(_) => false,
            }
        }
    }
}

#[cfg(not(unix))]
pub use windows::TaskkillSignaller;

#[cfg(not(unix))]
mod windows {
    use super::{ProcessSignaller, SignalError};
    use std::process::{Command, Stdio};

    /// `taskkill` based termination. Suspending is not available.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TaskkillSignaller;

    impl TaskkillSignaller {
        fn taskkill(&self, pid: u32, force: bool) -> Result<(), SignalError> {
            let pid_arg = pid.to_string();
            let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
            if force {
                args.push("/F");
            }
            let status = Command::new("taskkill")
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|e| SignalError::Failed {
                    pid,
                    reason: e.to_string(),
                })?;
            if status.success() {
                Ok(())
            } else if !self.is_alive(pid) {
                Err(SignalError::NoSuchProcess { pid })
            } else {
                Err(SignalError::Failed {
                    pid,
                    reason: format!("taskkill exited with {status}"),
                })
            }
        }
    }

    impl ProcessSignaller for TaskkillSignaller {
        fn suspend(&self, _pid: u32) -> Result<(), SignalError> {
            Err(SignalError::Unsupported { operation: "suspend" })
        }

        fn resume(&self, _pid: u32) -> Result<(), SignalError> {
            Err(SignalError::Unsupported { operation: "resume" })
        }

        fn terminate(&self, pid: u32) -> Result<(), SignalError> {
            self.taskkill(pid, false)
        }

        fn kill(&self, pid: u32) -> Result<(), SignalError> {
            self.taskkill(pid, true)
        }

        fn is_alive(&self, pid: u32) -> bool {
            let filter = format!("PID eq {pid}");
            Command::new("tasklist")
                .args(["/FI", filter.as_str(), "/NH"])
                .stderr(Stdio::null())
                .output()
                .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ProcessSignaller, SignalError};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// In-memory signaller that records every call.
    ///
    /// Live PIDs die on `terminate` unless marked stubborn, and always die
    /// on `kill`.
    #[derive(Default)]
    pub struct RecordingSignaller {
        alive: Mutex<BTreeSet<u32>>,
        stubborn: Mutex<BTreeSet<u32>>,
        calls: Mutex<Vec<(&'static str, u32)>>,
    }

    impl RecordingSignaller {
        pub fn with_alive(pids: &[u32]) -> Self {
            let s = Self::default();
            s.alive.lock().unwrap().extend(pids.iter().copied());
            s
        }

        pub fn set_stubborn(&self, pid: u32) {
            self.stubborn.lock().unwrap().insert(pid);
        }

        pub fn calls(&self) -> Vec<(&'static str, u32)> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &'static str, pid: u32) -> Result<(), SignalError> {
            self.calls.lock().unwrap().push((op, pid));
            if self.alive.lock().unwrap().contains(&pid) {
                Ok(())
            } else {
                Err(SignalError::NoSuchProcess { pid })
            }
        }
    }

    impl ProcessSignaller for RecordingSignaller {
        fn suspend(&self, pid: u32) -> Result<(), SignalError> {
            self.record("suspend", pid)
        }

        fn resume(&self, pid: u32) -> Result<(), SignalError> {
            self.record("resume", pid)
        }

        fn terminate(&self, pid: u32) -> Result<(), SignalError> {
            self.record("terminate", pid)?;
            if !self.stubborn.lock().unwrap().contains(&pid) {
                self.alive.lock().unwrap().remove(&pid);
            }
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<(), SignalError> {
            self.record("kill", pid)?;
            self.alive.lock().unwrap().remove(&pid);
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }
}
