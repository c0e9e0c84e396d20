/// Lifecycle Controller: pause, resume and the escalating stop sequence.
///
/// Every operation handles each PID independently. A process that already
/// exited is reported, never allowed to abort the rest of the batch.
use crate::log_tail;
use crate::pid;
use crate::process_control::{ProcessSignaller, SignalError};
use crate::progress::RunState;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Errors from pause/resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No child PIDs and no supervising PID are known. Nothing was signalled.
    NoTargetProcess,
    /// The platform cannot perform the operation.
    Unsupported { operation: &'static str },
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::NoTargetProcess => {
                write!(f, "no render process is known (no PID file and no child records)")
            }
            ControlError::Unsupported { operation } => {
                write!(f, "{operation} is not supported on this platform")
            }
        }
    }
}

impl std::error::Error for ControlError {}

/// Per-PID result of a pause or resume.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SignalReport {
    pub delivered: Vec<u32>,
    pub failed: Vec<(u32, SignalError)>,
}

impl SignalReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// PIDs to suspend or resume: active children, else the supervising process.
pub fn pause_targets(state: &RunState, pid_file: &Path) -> Vec<u32> {
    let workers = pid::worker_pids(state);
    if !workers.is_empty() {
        return workers;
    }
    pid::resolve_supervising_pid(pid_file, state)
        .into_iter()
        .collect()
}

/// Suspend every target process.
pub fn pause(
    signaller: &dyn ProcessSignaller,
    state: &RunState,
    pid_file: &Path,
) -> Result<SignalReport, ControlError> {
    signal_all(state, pid_file, "suspend", |pid| signaller.suspend(pid))
}

/// Continue every target process.
pub fn resume(
    signaller: &dyn ProcessSignaller,
    state: &RunState,
    pid_file: &Path,
) -> Result<SignalReport, ControlError> {
    signal_all(state, pid_file, "resume", |pid| signaller.resume(pid))
}

/// Send `op` to an explicit PID list, e.g. the PIDs a session suspended.
pub fn signal_pids(
    pids: &[u32],
    operation: &'static str,
    mut op: impl FnMut(u32) -> Result<(), SignalError>,
) -> SignalReport {
    let mut report = SignalReport::default();
    for &pid in pids {
        match op(pid) {
            Ok(()) => report.delivered.push(pid),
            Err(e) => {
                tracing::warn!(pid, operation, error = %e, "signal not delivered");
                report.failed.push((pid, e));
            }
        }
    }
    report
}

fn signal_all(
    state: &RunState,
    pid_file: &Path,
    operation: &'static str,
    op: impl FnMut(u32) -> Result<(), SignalError>,
) -> Result<SignalReport, ControlError> {
    let targets = pause_targets(state, pid_file);
    if targets.is_empty() {
        return Err(ControlError::NoTargetProcess);
    }
    let report = signal_pids(&targets, operation, op);
    if report.delivered.is_empty()
        && report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, SignalError::Unsupported { .. }))
    {
        return Err(ControlError::Unsupported { operation });
    }
    tracing::info!(
        operation,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "signalled render processes"
    );
    Ok(report)
}

/// How one PID went down during stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Already gone before we signalled it.
    NotRunning,
    /// Exited within the grace window.
    Terminated,
    /// Needed a forced kill.
    Killed,
    /// Could not be signalled.
    Failed(SignalError),
}

/// Everything the stop sequence did.
#[derive(Debug, Default, Clone)]
pub struct StopReport {
    pub runner: Option<(u32, StopOutcome)>,
    pub children: Vec<(u32, StopOutcome)>,
    pub pid_file_removed: bool,
}

/// The escalating stop, run as a background task.
#[derive(Debug, Clone)]
pub struct StopSequence {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    /// Offset where the current run's log output begins.
    pub log_floor: u64,
    /// Optional side file of child PIDs kept by the worker.
    pub children_file: PathBuf,
    pub stop_log: PathBuf,
    pub grace: Duration,
    pub poll: Duration,
}

impl StopSequence {
    /// Start the sequence without waiting on it.
    pub fn spawn(self, signaller: Arc<dyn ProcessSignaller>) -> JoinHandle<StopReport> {
        tokio::spawn(async move { self.run(signaller.as_ref()).await })
    }

    /// Runner first, then every child the log ever named, then PID-file cleanup.
    pub async fn run(&self, signaller: &dyn ProcessSignaller) -> StopReport {
        let mut report = StopReport::default();
        let runner = pid::read_pid_file(&self.pid_file);

        let mut children = match log_tail::read_tail(&self.log_file, u64::MAX, self.log_floor) {
            Ok(tail) => pid::child_pids_in_log(&tail.text),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.log_file.display(), "could not rescan log for child PIDs");
                Default::default()
            }
        };
        children.extend(pid::pids_in_file(&self.children_file));
        if let Some(runner) = runner {
            children.remove(&runner);
        }

        self.note(&format!(
            "Stop requested. Runner: {}. Children: {}",
            runner.map_or("(none)".to_string(), |p| p.to_string()),
            if children.is_empty() {
                "(none)".to_string()
            } else {
                children.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
            }
        ));

        if let Some(pid) = runner {
            let outcome = self.bring_down(signaller, pid).await;
            self.note(&format!("runner {pid}: {outcome:?}"));
            report.runner = Some((pid, outcome));
        }

        for pid in children {
            let outcome = self.bring_down(signaller, pid).await;
            self.note(&format!("child {pid}: {outcome:?}"));
            report.children.push((pid, outcome));
        }

        match crate::launcher::clear_pid_file(&self.pid_file) {
            Ok(removed) => report.pid_file_removed = removed,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.pid_file.display(), "failed to remove PID file after stop")
            }
        }
        let _ = std::fs::remove_file(&self.children_file);
        self.note("Stop sequence finished");

        tracing::info!(
            runner = ?report.runner,
            children = report.children.len(),
            "stop sequence finished"
        );
        report
    }

    /// Terminate, wait out the grace window, then kill.
    async fn bring_down(&self, signaller: &dyn ProcessSignaller, pid: u32) -> StopOutcome {
        if !signaller.is_alive(pid) {
            return StopOutcome::NotRunning;
        }
        match signaller.terminate(pid) {
            Ok(()) => {}
            Err(SignalError::NoSuchProcess { .. }) => return StopOutcome::NotRunning,
            Err(e) => tracing::warn!(pid, error = %e, "terminate failed, escalating"),
        }
        // A suspended process cannot act on the termination request.
        let _ = signaller.resume(pid);

        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline {
            if !signaller.is_alive(pid) {
                return StopOutcome::Terminated;
            }
            tokio::time::sleep(self.poll).await;
        }
        if !signaller.is_alive(pid) {
            return StopOutcome::Terminated;
        }

        tracing::warn!(pid, grace_ms = self.grace.as_millis() as u64, "process outlived grace window, killing");
        match signaller.kill(pid) {
            Ok(()) => StopOutcome::Killed,
            Err(SignalError::NoSuchProcess { .. }) => StopOutcome::Terminated,
            Err(e) => StopOutcome::Failed(e),
        }
    }

    /// Append a timestamped line to the stop log. Best effort.
    fn note(&self, msg: &str) {
        let line = format!("[{}] {msg}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        let result = self
            .stop_log
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.stop_log)
            })
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::debug!(error = %e, path = %self.stop_log.display(), "could not write stop log");
        }
    }
}
