/// Monitor: the cancellable poll loop that turns the worker's log into
/// progress updates.
///
/// Each tick re-arms with a fresh sleep after it finishes, so a slow tick
/// delays the next one instead of overlapping it.
use crate::events;
use crate::log_tail;
use crate::progress::{RunState, RunStatus};
use crate::status::StatusFile;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What the observer sees after each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: RunStatus,
    pub percent: f64,
    /// Tail text, only when it changed since the previous update.
    pub tail: Option<String>,
}

/// Everything one monitoring session needs.
#[derive(Debug, Clone)]
pub struct MonitorContext {
    pub state: Arc<Mutex<RunState>>,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_floor: u64,
    pub tail_bytes: u64,
    pub poll_interval: Duration,
    pub stop_timeout: Option<Duration>,
    pub status_file: Option<StatusFile>,
    pub launched_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Handle to a running poll loop.
pub struct Monitor {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl Monitor {
    /// Start polling. Updates go to `observer` until a terminal status is
    /// emitted, the observer goes away, or the monitor is cancelled.
    pub fn spawn(ctx: MonitorContext, observer: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run(ctx, observer, cancel_rx));
        Self { handle, cancel }
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "monitor task ended abnormally");
        }
    }
}

async fn run(
    ctx: MonitorContext,
    observer: mpsc::UnboundedSender<ProgressUpdate>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = Ticker::new(ctx.log_floor);
    tracing::debug!(log = %ctx.log_file.display(), floor = ctx.log_floor, "monitoring started");
    loop {
        let update = ticker.tick(&ctx);
        let terminal = update.status.is_terminal();
        if observer.send(update).is_err() {
            tracing::debug!("observer gone, monitoring stopped");
            break;
        }
        if terminal {
            tracing::debug!("terminal status reached, monitoring stopped");
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(ctx.poll_interval) => {}
            _ = cancel.changed() => {
                tracing::debug!("monitoring cancelled");
                break;
            }
        }
    }
}

/// Per-session tick state kept between polls.
struct Ticker {
    floor: u64,
    last_tail: Option<String>,
}

impl Ticker {
    fn new(floor: u64) -> Self {
        Self {
            floor,
            last_tail: None,
        }
    }

    fn tick(&mut self, ctx: &MonitorContext) -> ProgressUpdate {
        let tail = match log_tail::read_tail(&ctx.log_file, ctx.tail_bytes, self.floor) {
            Ok(tail) => {
                tracing::trace!(from = tail.start_offset, len = tail.file_len, "read log tail");
                if tail.file_len < self.floor {
                    tracing::info!(floor = self.floor, len = tail.file_len, "log shrank, reading from the start");
                    self.floor = 0;
                }
                tail
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %ctx.log_file.display(), "failed to read log tail");
                Default::default()
            }
        };
        let records = events::parse_all(&tail.text);
        let pid_file_present = ctx.pid_file.exists();

        let (status, percent) = {
            let mut state = ctx.state.lock().unwrap_or_else(|e| e.into_inner());
            state.apply_all(&records);
            state.promote(pid_file_present);
            if let Some(timeout) = ctx.stop_timeout {
                if state.expire_stop(timeout) {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "no completion record after stop, giving up"
                    );
                }
            }
            if let Some(status_file) = &ctx.status_file {
                status_file.write_state(&state, ctx.log_floor, ctx.launched_at);
            }
            (state.status, state.percent())
        };

        let tail_changed = self.last_tail.as_deref() != Some(tail.text.as_str());
        let tail = if tail_changed {
            self.last_tail = Some(tail.text.clone());
            Some(tail.text)
        } else {
            None
        };
        ProgressUpdate {
            status,
            percent,
            tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn context(dir: &std::path::Path) -> MonitorContext {
        MonitorContext {
            state: Arc::new(Mutex::new({
                let mut s = RunState::default();
                s.reset_for_launch(Some((1, 50)));
                s
            })),
            log_file: dir.join("last_run.log"),
            pid_file: dir.join("runner_pid.txt"),
            log_floor: 0,
            tail_bytes: 64 * 1024,
            poll_interval: Duration::from_millis(20),
            stop_timeout: None,
            status_file: None,
            launched_at: None,
        }
    }

    fn append(path: &std::path::Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_tick_reports_progress_and_suppresses_unchanged_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        append(
            &ctx.log_file,
            "Launched child[0] pid=1001 frames=1-50\n[1001 STDOUT] PROGRESS:  0;00;00;24 (25): 0 Seconds\n",
        );

        let mut ticker = Ticker::new(0);
        let first = ticker.tick(&ctx);
        assert_eq!(first.status, RunStatus::Running);
        assert_eq!(first.percent, 50.0);
        assert!(first.tail.is_some());

        let second = ticker.tick(&ctx);
        assert_eq!(second.percent, 50.0);
        assert!(second.tail.is_none());
    }

    #[test]
    fn test_tick_stays_starting_until_signs_of_life() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut ticker = Ticker::new(0);
        assert_eq!(ticker.tick(&ctx).status, RunStatus::Starting);

        std::fs::write(&ctx.pid_file, "77").unwrap();
        assert_eq!(ticker.tick(&ctx).status, RunStatus::Running);
    }

    #[test]
    fn test_previous_run_completion_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let old = "Run complete rc=0\n";
        append(&ctx.log_file, old);
        ctx.log_floor = old.len() as u64;

        let mut ticker = Ticker::new(ctx.log_floor);
        assert_eq!(ticker.tick(&ctx).status, RunStatus::Starting);
    }

    #[test]
    fn test_stop_timeout_becomes_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.stop_timeout = Some(Duration::ZERO);
        ctx.state.lock().unwrap().mark_stopping();

        let mut ticker = Ticker::new(0);
        assert_eq!(ticker.tick(&ctx).status, RunStatus::Indeterminate);
    }

    #[test]
    fn test_tick_writes_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let status_file = StatusFile::new(dir.path().join("status.json"));
        ctx.status_file = Some(status_file.clone());
        append(&ctx.log_file, "Runner pid=5\n");

        Ticker::new(0).tick(&ctx);
        let data = status_file.read().unwrap().unwrap();
        assert_eq!(data.status, RunStatus::Running);
        assert_eq!(data.supervising_pid, Some(5));
    }

    #[tokio::test]
    async fn test_monitor_disables_itself_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        append(
            &ctx.log_file,
            "Launched child[0] pid=1001 frames=1-50\n[1001 STDOUT] PROGRESS:  0;00;00;24 (25): 0 Seconds\n",
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = Monitor::spawn(ctx.clone(), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.percent, 50.0);

        append(&ctx.log_file, "Run complete rc=0\n");
        let mut last = first;
        while let Some(update) = rx.recv().await {
            last = update;
        }
        assert_eq!(last.status, RunStatus::Completed);
        monitor.join().await;
    }

    #[tokio::test]
    async fn test_corrupt_range_does_not_stop_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        append(&ctx.log_file, "Launched child[0] pid=1001 frames=0-9223372036854775807\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = Monitor::spawn(ctx.clone(), tx);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, RunStatus::Starting);

        append(&ctx.log_file, "Run complete rc=0\n");
        let mut last = first;
        while let Some(update) = rx.recv().await {
            last = update;
        }
        assert_eq!(last.status, RunStatus::Completed);
        monitor.join().await;
    }

    #[tokio::test]
    async fn test_monitor_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = Monitor::spawn(context(dir.path()), tx);
        rx.recv().await.unwrap();

        monitor.cancel();
        tokio::time::timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await
        .unwrap();
        monitor.join().await;
    }
}
