/// Supervisor: owns one monitoring session and everything that acts on it.
///
/// Holds the run state, the poll loop handle, the in-flight stop task and
/// the PIDs this session suspended, so teardown can put things back.
use crate::command::{self, LaunchPlan, Platform, WorkerPaths};
use crate::config::SupervisorConfig;
use crate::data_dir::DataDir;
use crate::discovery;
use crate::interpreter::{self, InterpreterError};
use crate::job::{RunConfiguration, ValidationError};
use crate::launcher::{self, LaunchError, LaunchReceipt};
use crate::lifecycle::{self, ControlError, SignalReport, StopReport, StopSequence};
use crate::monitor::{Monitor, MonitorContext, ProgressUpdate};
use crate::process_control::ProcessSignaller;
use crate::progress::{RunState, RunStatus};
use crate::status::StatusFile;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors surfaced by supervisor operations.
#[derive(Debug)]
pub enum SupervisorError {
    Validation(ValidationError),
    Interpreter(InterpreterError),
    Launch(LaunchError),
    Control(ControlError),
    /// The worker bundle has not been installed.
    BundleMissing { path: PathBuf },
    /// This session is already supervising a live run.
    AlreadyRunning { status: RunStatus },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Validation(e) => write!(f, "invalid job: {e}"),
            SupervisorError::Interpreter(e) => write!(f, "{e}"),
            SupervisorError::Launch(e) => write!(f, "{e}"),
            SupervisorError::Control(e) => write!(f, "{e}"),
            SupervisorError::BundleMissing { path } => write!(
                f,
                "worker bundle not installed ({} missing); run `install` first",
                path.display()
            ),
            SupervisorError::AlreadyRunning { status } => {
                write!(f, "a run is already in progress (status: {status})")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Validation(e) => Some(e),
            SupervisorError::Interpreter(e) => Some(e),
            SupervisorError::Launch(e) => Some(e),
            SupervisorError::Control(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for SupervisorError {
    fn from(e: ValidationError) -> Self {
        SupervisorError::Validation(e)
    }
}

impl From<InterpreterError> for SupervisorError {
    fn from(e: InterpreterError) -> Self {
        SupervisorError::Interpreter(e)
    }
}

impl From<LaunchError> for SupervisorError {
    fn from(e: LaunchError) -> Self {
        SupervisorError::Launch(e)
    }
}

impl From<ControlError> for SupervisorError {
    fn from(e: ControlError) -> Self {
        SupervisorError::Control(e)
    }
}

/// One host session supervising at most one render run.
pub struct Supervisor {
    config: SupervisorConfig,
    data_dir: DataDir,
    signaller: Arc<dyn ProcessSignaller>,
    state: Arc<Mutex<RunState>>,
    status_file: StatusFile,
    monitor: Option<Monitor>,
    stop_task: Option<JoinHandle<StopReport>>,
    suspended: BTreeSet<u32>,
    log_baseline: u64,
    launched_at: Option<DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        data_dir: DataDir,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Self {
        let status_file = StatusFile::new(data_dir.status());
        Self {
            config,
            data_dir,
            signaller,
            state: Arc::new(Mutex::new(RunState::default())),
            status_file,
            monitor: None,
            stop_task: None,
            suspended: BTreeSet::new(),
            log_baseline: 0,
            launched_at: None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_status(&self) {
        let state = self.lock_state();
        self.status_file
            .write_state(&state, self.log_baseline, self.launched_at);
    }

    /// Validate, build and launch a job, then start monitoring it.
    pub async fn launch(
        &mut self,
        job: &RunConfiguration,
        observer: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<LaunchReceipt, SupervisorError> {
        let status = self.status();
        if self.monitor.as_ref().is_some_and(|m| !m.is_finished()) && !status.is_terminal() {
            return Err(SupervisorError::AlreadyRunning { status });
        }

        job.validate()?;
        let script = self.data_dir.script();
        if !script.is_file() {
            return Err(SupervisorError::BundleMissing { path: script });
        }
        if discovery::resolve_renderer(
            job.overrides.renderer.as_deref(),
            job.overrides.after_effects_dir.as_deref(),
        )
        .is_none()
        {
            tracing::warn!("no renderer found locally; the worker will search on its own");
        }
        let interpreter = interpreter::resolve(&self.config.interpreter)?;

        let paths = WorkerPaths {
            script: script.clone(),
            log_file: self.data_dir.log_file(),
            pid_file: self.data_dir.pid_file(),
        };
        let args = command::worker_args(job, &paths);
        let plan = LaunchPlan::build(
            Platform::current(),
            &interpreter,
            &script,
            &args,
            &self.data_dir.wrapper_script(),
        );

        let receipt = launcher::launch(&plan, &paths.pid_file, &paths.log_file)?;

        // The old loop must be gone before the state is reset under it.
        self.retire_monitor().await;
        self.suspended.clear();
        self.log_baseline = receipt.log_baseline;
        self.launched_at = Some(receipt.launched_at);
        self.lock_state().reset_for_launch(job.session_range());
        self.write_status();
        self.start_monitor(observer);
        Ok(receipt)
    }

    /// Monitor a run that was launched elsewhere, e.g. by an earlier session.
    pub async fn attach(&mut self, observer: mpsc::UnboundedSender<ProgressUpdate>) {
        self.retire_monitor().await;
        let previous = match self.status_file.read() {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable status file");
                None
            }
        };
        self.log_baseline = previous.as_ref().map_or(0, |p| p.log_baseline);
        self.launched_at = previous.and_then(|p| p.launched_at);
        self.lock_state().reset_for_launch(None);
        self.start_monitor(observer);
    }

    fn start_monitor(&mut self, observer: mpsc::UnboundedSender<ProgressUpdate>) {
        let ctx = MonitorContext {
            state: Arc::clone(&self.state),
            log_file: self.data_dir.log_file(),
            pid_file: self.data_dir.pid_file(),
            log_floor: self.log_baseline,
            tail_bytes: self.config.monitor.tail_bytes,
            poll_interval: self.config.monitor.poll_interval(),
            stop_timeout: self.config.monitor.stop_timeout(),
            status_file: Some(self.status_file.clone()),
            launched_at: self.launched_at,
        };
        self.monitor = Some(Monitor::spawn(ctx, observer));
    }

    async fn retire_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
            monitor.join().await;
        }
    }

    /// Suspend the run's processes.
    pub fn pause(&mut self) -> Result<SignalReport, SupervisorError> {
        let report = {
            let mut state = self.lock_state();
            let report =
                lifecycle::pause(self.signaller.as_ref(), &state, &self.data_dir.pid_file())?;
            if !report.delivered.is_empty() {
                state.mark_paused();
            }
            report
        };
        self.suspended.extend(report.delivered.iter().copied());
        self.write_status();
        Ok(report)
    }

    /// Continue the run's processes.
    pub fn resume(&mut self) -> Result<SignalReport, SupervisorError> {
        let report = {
            let mut state = self.lock_state();
            let report =
                lifecycle::resume(self.signaller.as_ref(), &state, &self.data_dir.pid_file())?;
            state.mark_resumed();
            report
        };
        for pid in &report.delivered {
            self.suspended.remove(pid);
        }
        self.write_status();
        Ok(report)
    }

    /// Kick off the stop sequence in the background. Monitoring keeps running
    /// and reports the terminal status once the worker logs it.
    pub fn stop(&mut self) {
        if self.stop_task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::info!("stop already in progress");
            return;
        }
        self.lock_state().mark_stopping();
        self.write_status();
        let sequence = StopSequence {
            pid_file: self.data_dir.pid_file(),
            log_file: self.data_dir.log_file(),
            log_floor: self.log_baseline,
            children_file: self.data_dir.children_pid_file(),
            stop_log: self.data_dir.stop_log(),
            grace: self.config.stop.grace(),
            poll: self.config.stop.poll(),
        };
        // Stopped processes cannot be resumed later.
        self.suspended.clear();
        self.stop_task = Some(sequence.spawn(Arc::clone(&self.signaller)));
    }

    pub fn status(&self) -> RunStatus {
        self.lock_state().status
    }

    pub fn snapshot(&self) -> RunState {
        self.lock_state().clone()
    }

    /// Show `Stopping` for a stop issued by another process, so the stop
    /// timeout applies while waiting for the worker's completion record.
    pub fn expect_stop(&mut self) {
        self.lock_state().mark_stopping();
    }

    /// PIDs this session suspended and has not resumed.
    pub fn suspended(&self) -> Vec<u32> {
        self.suspended.iter().copied().collect()
    }

    /// End the session: stop monitoring, let an in-flight stop finish, and
    /// resume anything this session left suspended.
    pub async fn shutdown(mut self) -> Option<StopReport> {
        self.retire_monitor().await;
        let stop_report = match self.stop_task.take() {
            Some(task) => match task.await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(error = %e, "stop task ended abnormally");
                    None
                }
            },
            None => None,
        };
        if !self.suspended.is_empty() {
            let pids = self.suspended();
            tracing::info!(pids = ?pids, "resuming processes suspended by this session");
            let signaller = Arc::clone(&self.signaller);
            lifecycle::signal_pids(&pids, "resume", |pid| signaller.resume(pid));
            self.suspended.clear();
            self.lock_state().mark_resumed();
            self.write_status();
        }
        stop_report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_control::testing::RecordingSignaller;
    use std::time::Duration;

    fn supervisor(dir: &std::path::Path, signaller: Arc<RecordingSignaller>) -> Supervisor {
        let mut config = SupervisorConfig::default();
        config.monitor.poll_interval_ms = 20;
        config.stop.grace_ms = 100;
        config.stop.poll_ms = 10;
        let data_dir = DataDir::new(dir);
        data_dir.init().unwrap();
        Supervisor::new(config, data_dir, signaller)
    }

    fn sample_job(dir: &std::path::Path) -> RunConfiguration {
        use crate::job::{ConcurrencyMode, FeatureFlags, FrameScope, PathOverrides, TargetSelector};
        let project = dir.join("shot.aep");
        std::fs::write(&project, b"").unwrap();
        RunConfiguration {
            project,
            output: dir.join("out_[####].png"),
            target: TargetSelector::Composition("Main".into()),
            frames: FrameScope::Range { start: 1, end: 10 },
            concurrency: ConcurrencyMode::Fixed(1),
            features: FeatureFlags::default(),
            overrides: PathOverrides::default(),
        }
    }

    async fn drain_until(
        rx: &mut mpsc::UnboundedReceiver<ProgressUpdate>,
        mut done: impl FnMut(&ProgressUpdate) -> bool,
    ) -> ProgressUpdate {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let update = rx.recv().await.expect("monitor ended early");
                if done(&update) {
                    return update;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_launch_requires_installed_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(RecordingSignaller::default()));
        let job = sample_job(dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = sup.launch(&job, tx).await.unwrap_err();
        assert!(matches!(err, SupervisorError::BundleMissing { .. }));
        assert_eq!(sup.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_pause_with_nothing_known_fails() {
        let dir = tempfile::tempdir().unwrap();
        let signaller = Arc::new(RecordingSignaller::default());
        let mut sup = supervisor(dir.path(), signaller.clone());
        let err = sup.pause().unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Control(ControlError::NoTargetProcess)
        ));
        assert!(signaller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_attach_pause_and_resume_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let signaller = Arc::new(RecordingSignaller::with_alive(&[501, 502]));
        let mut sup = supervisor(dir.path(), signaller.clone());
        std::fs::write(
            sup.data_dir.log_file(),
            "Launched child[0] pid=501 frames=1-10\nLaunched child[1] pid=502 frames=11-20\n",
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        sup.attach(tx).await;
        drain_until(&mut rx, |u| u.status == RunStatus::Running).await;

        let report = sup.pause().unwrap();
        assert_eq!(report.delivered, vec![501, 502]);
        assert_eq!(sup.status(), RunStatus::Paused);
        assert_eq!(sup.suspended(), vec![501, 502]);

        sup.shutdown().await;
        let calls = signaller.calls();
        assert_eq!(
            calls,
            vec![
                ("suspend", 501),
                ("suspend", 502),
                ("resume", 501),
                ("resume", 502)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reattach_waits_for_previous_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(RecordingSignaller::default()));
        std::fs::write(sup.data_dir.log_file(), "Runner pid=700\n").unwrap();

        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        sup.attach(old_tx).await;
        drain_until(&mut old_rx, |u| u.status == RunStatus::Running).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        sup.attach(tx).await;
        // The first loop has been joined, so its sender is already dropped.
        loop {
            match old_rx.try_recv() {
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => panic!("previous monitor still running"),
            }
        }
        drain_until(&mut rx, |u| u.status == RunStatus::Running).await;
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_reports_stopping_then_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let signaller = Arc::new(RecordingSignaller::with_alive(&[600]));
        let mut sup = supervisor(dir.path(), signaller.clone());
        let log = sup.data_dir.log_file();
        std::fs::write(sup.data_dir.pid_file(), "600").unwrap();
        std::fs::write(&log, "Runner pid=600\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        sup.attach(tx).await;
        drain_until(&mut rx, |u| u.status == RunStatus::Running).await;

        sup.stop();
        assert_eq!(sup.status(), RunStatus::Stopping);
        std::fs::write(&log, "Runner pid=600\nRun complete rc=143\n").unwrap();
        let last = drain_until(&mut rx, |u| u.status.is_terminal()).await;
        assert_eq!(last.status, RunStatus::Stopped);

        let report = sup.shutdown().await.unwrap();
        assert_eq!(report.runner, Some((600, lifecycle::StopOutcome::Terminated)));
        assert!(!dir.path().join("runner_pid.txt").exists());
        assert!(signaller.calls().contains(&("terminate", 600)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_end_to_end_with_fake_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), Arc::new(RecordingSignaller::default()));
        sup.config.interpreter.path = Some(PathBuf::from("/bin/sh"));
        std::fs::write(sup.data_dir.log_file(), "Run complete rc=1\n").unwrap();
        std::fs::write(
            sup.data_dir.script(),
            r#"while [ $# -gt 0 ]; do
  case "$1" in
    --log_file) log="$2"; shift ;;
    --pid_file) pid="$2"; shift ;;
  esac
  shift
done
echo $$ > "$pid"
echo "Runner pid=$$" >> "$log"
echo "Launched child[0] pid=4242 frames=1-10" >> "$log"
echo "[4242 STDOUT] PROGRESS:  0;00;00;09 (10): 0 Seconds" >> "$log"
echo "Run complete rc=0" >> "$log"
"#,
        )
        .unwrap();

        let job = sample_job(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receipt = sup.launch(&job, tx).await.unwrap();
        assert_eq!(receipt.log_baseline, 18);

        let last = drain_until(&mut rx, |u| u.status.is_terminal()).await;
        assert_eq!(last.status, RunStatus::Completed);
        assert_eq!(last.percent, 100.0);

        let status = StatusFile::new(dir.path().join("status.json"))
            .read()
            .unwrap()
            .unwrap();
        assert_eq!(status.status, RunStatus::Completed);
        assert_eq!(status.log_baseline, 18);
        sup.shutdown().await;
    }
}
