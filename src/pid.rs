/// PID Resolver: which OS processes belong to the current run.
use crate::progress::RunState;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

static ANY_PID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)pid\s*=\s*(\d+)").unwrap());

static LAUNCHED_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Launched child\[\d+\]\s+pid=(\d+)").unwrap());

/// Read a PID file holding one positive decimal PID.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(path).ok()?;
    parse_positive(text.trim())
}

fn parse_positive(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u32>().ok().filter(|p| *p > 0)
}

/// The supervising PID. The PID file wins over a PID announced in the log.
pub fn resolve_supervising_pid(pid_file: &Path, state: &RunState) -> Option<u32> {
    read_pid_file(pid_file).or(state.supervising_pid.filter(|p| *p > 0))
}

/// Worker-child PIDs known from the log, possibly empty.
pub fn worker_pids(state: &RunState) -> Vec<u32> {
    state.worker_pids()
}

/// Every PID the log mentions as a child or with an explicit `pid=`.
///
/// Broader than the parsed records on purpose: stop uses it to catch
/// children the supervising process failed to clean up.
pub fn child_pids_in_log(text: &str) -> BTreeSet<u32> {
    LAUNCHED_PID
        .captures_iter(text)
        .chain(ANY_PID.captures_iter(text))
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .filter(|pid| *pid > 1)
        .collect()
}

/// PIDs listed in a side file such as `children_pids.txt`: `pid=` matches
/// and bare numeric lines. Missing file yields nothing.
pub fn pids_in_file(path: &Path) -> BTreeSet<u32> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return BTreeSet::new();
    };
    let mut pids: BTreeSet<u32> = ANY_PID
        .captures_iter(&text)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .collect();
    pids.extend(text.lines().filter_map(|l| parse_positive(l.trim())));
    pids.retain(|pid| *pid > 1);
    pids
}
