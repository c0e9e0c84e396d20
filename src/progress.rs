/// Progress Tracker state: the in-memory picture of one supervised run.
///
/// Records are applied cumulatively. Replaying the same tail twice leaves the
/// state unchanged, so every poll can re-parse the whole tail window.
use crate::events::LogRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Lifecycle of a supervised run as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
    Stopped,
    /// A stop was requested but no completion record arrived in time.
    Indeterminate,
}

impl RunStatus {
    /// Terminal statuses end monitoring.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped | RunStatus::Indeterminate
        )
    }

    /// Map a `Run complete rc=<code>` value.
    pub fn from_exit_code(rc: i32) -> Self {
        match rc {
            0 => RunStatus::Completed,
            130 | 143 => RunStatus::Stopped,
            _ => RunStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::Indeterminate => "indeterminate",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive count of `start..=end`, 0 when `end < start`. Never overflows.
fn span(start: i64, end: i64) -> u64 {
    if end < start {
        return 0;
    }
    (end.abs_diff(start)).saturating_add(1)
}

/// One worker child and the latest frame it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProgress {
    pub pid: u32,
    pub range_start: i64,
    pub range_end: i64,
    /// Raw absolute frame number from the latest progress record.
    pub last_frame: Option<i64>,
}

impl ChildProgress {
    pub fn total(&self) -> u64 {
        span(self.range_start, self.range_end)
    }

    /// Frames completed as observed. Not clamped to `total()`.
    pub fn frames_done(&self) -> u64 {
        match self.last_frame {
            Some(frame) => span(self.range_start, frame),
            None => 0,
        }
    }

    /// What this child adds to the aggregate numerator.
    pub fn contribution(&self) -> u64 {
        self.frames_done().min(self.total())
    }
}

/// Mutable state of the current run.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    pub supervising_pid: Option<u32>,
    pub children: BTreeMap<u32, ChildProgress>,
    /// Latest raw frame per PID, including PIDs with no known range yet.
    pub progress_seen: BTreeMap<u32, i64>,
    /// Configured start/end of the whole job, used before any child range is known.
    pub session_range: Option<(i64, i64)>,
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub stop_requested_at: Option<Instant>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            supervising_pid: None,
            children: BTreeMap::new(),
            progress_seen: BTreeMap::new(),
            session_range: None,
            exit_code: None,
            stop_requested_at: None,
        }
    }
}

impl RunState {
    /// Forget everything about the previous run and enter `Starting`.
    pub fn reset_for_launch(&mut self, session_range: Option<(i64, i64)>) {
        *self = RunState {
            status: RunStatus::Starting,
            session_range,
            ..RunState::default()
        };
    }

    /// Record that a stop was issued. Terminal runs are left alone.
    pub fn mark_stopping(&mut self) {
        if !self.status.is_terminal() {
            self.status = RunStatus::Stopping;
            self.stop_requested_at = Some(Instant::now());
        }
    }

    pub fn mark_paused(&mut self) {
        if matches!(self.status, RunStatus::Starting | RunStatus::Running) {
            self.status = RunStatus::Paused;
        }
    }

    pub fn mark_resumed(&mut self) {
        if self.status == RunStatus::Paused {
            self.status = RunStatus::Running;
        }
    }

    /// `Starting` becomes `Running` once the run shows signs of life.
    pub fn promote(&mut self, pid_file_present: bool) {
        if self.status == RunStatus::Starting && (pid_file_present || self.has_activity()) {
            self.status = RunStatus::Running;
        }
    }

    /// Give up waiting on a stop that never produced a completion record.
    pub fn expire_stop(&mut self, timeout: std::time::Duration) -> bool {
        let expired = self.status == RunStatus::Stopping
            && self
                .stop_requested_at
                .is_some_and(|at| at.elapsed() >= timeout);
        if expired {
            self.status = RunStatus::Indeterminate;
        }
        expired
    }

    /// Apply one record.
    pub fn apply(&mut self, record: &LogRecord) {
        match *record {
            LogRecord::RunnerPid { pid } => {
                self.supervising_pid = Some(pid);
            }
            LogRecord::ChildLaunched { pid, start, end, .. } => {
                let child = self.children.entry(pid).or_insert(ChildProgress {
                    pid,
                    range_start: start,
                    range_end: end,
                    last_frame: None,
                });
                child.range_start = start;
                child.range_end = end;
                if child.last_frame.is_none() {
                    child.last_frame = self.progress_seen.get(&pid).copied();
                }
            }
            LogRecord::Progress { pid, frame } => {
                self.progress_seen.insert(pid, frame);
                if let Some(child) = self.children.get_mut(&pid) {
                    child.last_frame = Some(frame);
                }
            }
            LogRecord::RunComplete { rc } => {
                self.exit_code = Some(rc);
                if !self.status.is_terminal() {
                    self.status = RunStatus::from_exit_code(rc);
                }
            }
        }
    }

    pub fn apply_all(&mut self, records: &[LogRecord]) {
        for record in records {
            self.apply(record);
        }
    }

    /// Aggregate completion in `[0, 100]`.
    pub fn percent(&self) -> f64 {
        let (done, total) = if self.children.is_empty() {
            self.fallback_counts()
        } else {
            self.children.values().fold((0u64, 0u64), |(d, t), c| {
                (d.saturating_add(c.contribution()), t.saturating_add(c.total()))
            })
        };
        if total == 0 {
            return 0.0;
        }
        100.0 * done as f64 / total as f64
    }

    /// Single-range estimate from the configured range and the furthest frame seen.
    fn fallback_counts(&self) -> (u64, u64) {
        let Some((start, end)) = self.session_range else {
            return (0, 0);
        };
        let single = ChildProgress {
            pid: 0,
            range_start: start,
            range_end: end,
            last_frame: self.progress_seen.values().copied().max(),
        };
        (single.contribution(), single.total())
    }

    /// Known worker PIDs: launched children, else PIDs seen reporting progress.
    pub fn worker_pids(&self) -> Vec<u32> {
        if !self.children.is_empty() {
            return self.children.keys().copied().collect();
        }
        self.progress_seen.keys().copied().collect()
    }

    /// Whether any record has tied this run to a live process yet.
    pub fn has_activity(&self) -> bool {
        self.supervising_pid.is_some() || !self.children.is_empty() || !self.progress_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_all;

    fn child(start: i64, end: i64, frame: Option<i64>) -> ChildProgress {
        ChildProgress {
            pid: 1,
            range_start: start,
            range_end: end,
            last_frame: frame,
        }
    }

    #[test]
    fn test_contribution_within_bounds() {
        for frame in [None, Some(-5), Some(0), Some(1), Some(25), Some(50), Some(51), Some(1000)] {
            let c = child(1, 50, frame);
            assert!(c.contribution() <= c.total());
        }
        // Raw value is kept above total, only the contribution is clamped.
        let c = child(1, 50, Some(80));
        assert_eq!(c.frames_done(), 80);
        assert_eq!(c.contribution(), 50);
    }

    #[test]
    fn test_extreme_frame_values_do_not_overflow() {
        let c = child(i64::MIN, i64::MAX, Some(i64::MAX));
        assert_eq!(c.total(), u64::MAX);
        assert_eq!(c.contribution(), u64::MAX);
        assert_eq!(child(i64::MAX, i64::MAX, Some(i64::MIN)).frames_done(), 0);
        assert_eq!(child(1, 10, Some(i64::MAX)).contribution(), 10);

        let mut state = RunState::default();
        state.apply(&LogRecord::ChildLaunched { index: 0, pid: 10, start: 0, end: i64::MAX - 1 });
        state.apply(&LogRecord::ChildLaunched { index: 1, pid: 11, start: 0, end: i64::MAX - 1 });
        state.apply(&LogRecord::Progress { pid: 10, frame: i64::MAX });
        let pct = state.percent();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn test_frames_done_relative_to_range_start() {
        let c = child(101, 200, Some(150));
        assert_eq!(c.total(), 100);
        assert_eq!(c.frames_done(), 50);
    }

    #[test]
    fn test_percent_monotonic_in_progress() {
        let mut state = RunState::default();
        state.apply(&LogRecord::ChildLaunched { index: 0, pid: 10, start: 1, end: 40 });
        state.apply(&LogRecord::ChildLaunched { index: 1, pid: 11, start: 41, end: 100 });
        let mut last = state.percent();
        for frame in 41..=120 {
            state.apply(&LogRecord::Progress { pid: 11, frame });
            let now = state.percent();
            assert!(now >= last, "{now} < {last} at frame {frame}");
            last = now;
        }
        assert!(last <= 100.0);
    }

    #[test]
    fn test_percent_zero_without_anything_known() {
        assert_eq!(RunState::default().percent(), 0.0);
        let mut state = RunState::default();
        state.reset_for_launch(None);
        state.apply(&LogRecord::Progress { pid: 5, frame: 10 });
        assert_eq!(state.percent(), 0.0);
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let text = "\
Launched child[0] pid=1001 frames=1-50
[1001 STDOUT] PROGRESS:  0;00;00;09 (10): 0 Seconds
Launched child[1] pid=1002 frames=51-100
[1002 STDOUT] PROGRESS:  0;00;02;10 (60): 0 Seconds
";
        let records = parse_all(text);
        let mut state = RunState::default();
        state.apply_all(&records);
        let first = state.children.clone();
        let first_percent = state.percent();
        state.apply_all(&records);
        assert_eq!(state.children, first);
        assert_eq!(state.percent(), first_percent);
    }

    #[test]
    fn test_scenario_single_child_half_done() {
        let mut state = RunState::default();
        state.reset_for_launch(Some((1, 50)));
        state.apply_all(&parse_all(
            "Launched child[0] pid=1001 frames=1-50\n\
             [1001 STDOUT] PROGRESS:  0;00;00;24 (25): 0 Seconds\n",
        ));
        assert_eq!(state.percent(), 50.0);
        assert_eq!(state.status, RunStatus::Starting);
    }

    #[test]
    fn test_scenario_completion_codes() {
        for (rc, expected) in [
            (0, RunStatus::Completed),
            (143, RunStatus::Stopped),
            (130, RunStatus::Stopped),
            (1, RunStatus::Failed),
            (-9, RunStatus::Failed),
        ] {
            let mut state = RunState::default();
            state.reset_for_launch(None);
            state.apply(&LogRecord::RunComplete { rc });
            assert_eq!(state.status, expected, "rc={rc}");
            assert!(state.status.is_terminal());
            assert_eq!(state.exit_code, Some(rc));
        }
    }

    #[test]
    fn test_progress_before_launch_record_is_kept() {
        // A narrow tail can show progress before the child's launch line.
        let mut state = RunState::default();
        state.apply(&LogRecord::Progress { pid: 7, frame: 20 });
        state.apply(&LogRecord::ChildLaunched { index: 0, pid: 7, start: 11, end: 30 });
        assert_eq!(state.children[&7].last_frame, Some(20));
        assert_eq!(state.percent(), 50.0);
    }

    #[test]
    fn test_relaunch_record_does_not_reset_progress() {
        let mut state = RunState::default();
        state.apply(&LogRecord::ChildLaunched { index: 0, pid: 7, start: 1, end: 10 });
        state.apply(&LogRecord::Progress { pid: 7, frame: 6 });
        state.apply(&LogRecord::ChildLaunched { index: 0, pid: 7, start: 1, end: 10 });
        assert_eq!(state.children[&7].last_frame, Some(6));
    }

    #[test]
    fn test_fallback_uses_session_range_and_max_frame() {
        let mut state = RunState::default();
        state.reset_for_launch(Some((1, 200)));
        state.apply(&LogRecord::Progress { pid: 3, frame: 40 });
        state.apply(&LogRecord::Progress { pid: 4, frame: 100 });
        assert_eq!(state.percent(), 50.0);
    }

    #[test]
    fn test_worker_pids_prefers_children() {
        let mut state = RunState::default();
        assert!(state.worker_pids().is_empty());
        state.apply(&LogRecord::Progress { pid: 9, frame: 1 });
        assert_eq!(state.worker_pids(), vec![9]);
        state.apply(&LogRecord::ChildLaunched { index: 0, pid: 3, start: 1, end: 2 });
        assert_eq!(state.worker_pids(), vec![3]);
    }

    #[test]
    fn test_transitions() {
        let mut state = RunState::default();
        state.reset_for_launch(None);
        state.promote(false);
        assert_eq!(state.status, RunStatus::Starting);
        state.promote(true);
        assert_eq!(state.status, RunStatus::Running);

        state.mark_paused();
        assert_eq!(state.status, RunStatus::Paused);
        state.promote(true);
        assert_eq!(state.status, RunStatus::Paused);
        state.mark_resumed();
        assert_eq!(state.status, RunStatus::Running);

        state.mark_stopping();
        assert_eq!(state.status, RunStatus::Stopping);
        assert!(!state.expire_stop(std::time::Duration::from_secs(60)));
        assert!(state.expire_stop(std::time::Duration::ZERO));
        assert_eq!(state.status, RunStatus::Indeterminate);

        // Terminal statuses stick.
        state.mark_stopping();
        state.apply(&LogRecord::RunComplete { rc: 0 });
        assert_eq!(state.status, RunStatus::Indeterminate);
    }

    #[test]
    fn test_completion_overrides_stopping() {
        let mut state = RunState::default();
        state.reset_for_launch(None);
        state.mark_stopping();
        state.apply(&LogRecord::RunComplete { rc: 143 });
        assert_eq!(state.status, RunStatus::Stopped);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Indeterminate).unwrap(),
            "\"indeterminate\""
        );
        assert_eq!(RunStatus::Paused.to_string(), "paused");
    }
}
