/// Log record extraction.
///
/// Two grammars are accepted on each line:
/// - structured: a JSON object with `"v": 1` and an `"event"` tag
/// - text: the worker's free-text log lines, for example
///   `Launched child[0] pid=1001 frames=1-50`,
///   `[1001 STDOUT] PROGRESS:  0;00;00;24 (25): 0 Seconds`,
///   `Run complete rc=0`, `Runner pid=999`.
///
/// A malformed record is a [`ParseAnomaly`]; callers skip it and carry on.
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

const STRUCTURED_VERSION: u32 = 1;

/// Timestamp + level prefix written by the worker's log formatter.
static LINE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:,\d+)? \[[A-Z]+\] ").unwrap());

/// Output relayed from a worker child: `[<pid> STDOUT] ...`.
static CHILD_OUTPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d+) (?:STDOUT|STDERR)\]\s*(.*)$").unwrap());

static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PROGRESS:.*?\((\d+)\)").unwrap());

static CHILD_LAUNCHED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Launched child\[(\d+)\]\s+pid=(\d+)\s+frames=(\d+)-(\d+)").unwrap()
});

static RUN_COMPLETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Run complete rc=(-?\d+)").unwrap());

static RUNNER_PID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Runner pid=(\d+)").unwrap());

/// One record the tracker understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// The supervising process announced its PID.
    RunnerPid { pid: u32 },
    /// A worker child was started for an inclusive frame range.
    ChildLaunched {
        index: u32,
        pid: u32,
        start: i64,
        end: i64,
    },
    /// A worker child reported the frame it is on.
    Progress { pid: u32, frame: i64 },
    /// The supervising process finished with this exit code.
    RunComplete { rc: i32 },
}

/// A line that looked like a record but could not be read as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAnomaly {
    pub line: String,
    pub reason: String,
}

impl std::fmt::Display for ParseAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed log record ({}): {}", self.reason, self.line)
    }
}

impl std::error::Error for ParseAnomaly {}

#[derive(Debug, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(flatten)]
    event: StructuredEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StructuredEvent {
    Runner {
        pid: u32,
    },
    ChildLaunched {
        index: u32,
        pid: u32,
        start: i64,
        end: i64,
    },
    Progress {
        pid: u32,
        frame: i64,
    },
    RunComplete {
        rc: i32,
    },
}

/// Parse one log line. `Ok(None)` means the line carries no record.
pub fn parse_line(line: &str) -> Result<Option<LogRecord>, ParseAnomaly> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = match LINE_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    };
    let payload = payload.trim_start();
    let anomaly = |reason: &str| ParseAnomaly {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    // Relayed child output is only ever a progress record.
    if let Some(caps) = CHILD_OUTPUT.captures(payload) {
        let Some(progress) = PROGRESS.captures(&caps[2]) else {
            return Ok(None);
        };
        let pid = parse_pid(&caps[1]).ok_or_else(|| anomaly("bad child pid"))?;
        let frame: i64 = progress[1]
            .parse()
            .map_err(|_| anomaly("frame number out of range"))?;
        return Ok(Some(LogRecord::Progress { pid, frame }));
    }

    if payload.starts_with('{') {
        return parse_structured(payload).map(Some).map_err(|reason| ParseAnomaly {
            line: line.to_string(),
            reason,
        });
    }

    if let Some(caps) = CHILD_LAUNCHED.captures(payload) {
        let index = caps[1].parse().map_err(|_| anomaly("child index out of range"))?;
        let pid = parse_pid(&caps[2]).ok_or_else(|| anomaly("bad child pid"))?;
        let start: i64 = caps[3].parse().map_err(|_| anomaly("frame out of range"))?;
        let end: i64 = caps[4].parse().map_err(|_| anomaly("frame out of range"))?;
        if end < start {
            return Err(anomaly("frame range end before start"));
        }
        if range_len(start, end).is_none() {
            return Err(anomaly("frame range too large"));
        }
        return Ok(Some(LogRecord::ChildLaunched {
            index,
            pid,
            start,
            end,
        }));
    }
    if payload.contains("Launched child[") {
        return Err(anomaly("unreadable child launch record"));
    }

    if let Some(caps) = RUN_COMPLETE.captures(payload) {
        let rc = caps[1].parse().map_err(|_| anomaly("exit code out of range"))?;
        return Ok(Some(LogRecord::RunComplete { rc }));
    }
    if payload.contains("Run complete rc=") {
        return Err(anomaly("unreadable completion record"));
    }

    if let Some(caps) = RUNNER_PID.captures(payload) {
        let pid = parse_pid(&caps[1]).ok_or_else(|| anomaly("bad runner pid"))?;
        return Ok(Some(LogRecord::RunnerPid { pid }));
    }

    Ok(None)
}

/// Inclusive frame count of `start..=end`, if it fits in an i64.
fn range_len(start: i64, end: i64) -> Option<i64> {
    end.checked_sub(start).and_then(|d| d.checked_add(1))
}

fn parse_pid(s: &str) -> Option<u32> {
    s.parse::<u32>().ok().filter(|p| *p > 0)
}

fn parse_structured(payload: &str) -> Result<LogRecord, String> {
    let envelope: Envelope =
        serde_json::from_str(payload).map_err(|e| format!("invalid structured event: {e}"))?;
    if envelope.v != STRUCTURED_VERSION {
        return Err(format!("unsupported event version {}", envelope.v));
    }
    let record = match envelope.event {
        StructuredEvent::Runner { pid } => LogRecord::RunnerPid { pid },
        StructuredEvent::ChildLaunched {
            index,
            pid,
            start,
            end,
        } => {
            if end < start {
                return Err("frame range end before start".to_string());
            }
            if range_len(start, end).is_none() {
                return Err("frame range too large".to_string());
            }
            LogRecord::ChildLaunched {
                index,
                pid,
                start,
                end,
            }
        }
        StructuredEvent::Progress { pid, frame } => LogRecord::Progress { pid, frame },
        StructuredEvent::RunComplete { rc } => LogRecord::RunComplete { rc },
    };
    match record {
        LogRecord::RunnerPid { pid: 0 }
        | LogRecord::ChildLaunched { pid: 0, .. }
        | LogRecord::Progress { pid: 0, .. } => Err("pid must be positive".to_string()),
        record => Ok(record),
    }
}

/// Parse every line of `text` in order, skipping lines that carry no record
/// and logging (then skipping) anomalies.
pub fn parse_all(text: &str) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        match parse_line(line) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(anomaly) => tracing::debug!(%anomaly, "skipping log line"),
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_launched_text() {
        assert_eq!(
            parse_line("2024-05-01 10:00:00 [INFO] Launched child[0] pid=1001 frames=1-50").unwrap(),
            Some(LogRecord::ChildLaunched {
                index: 0,
                pid: 1001,
                start: 1,
                end: 50
            })
        );
    }

    #[test]
    fn test_launching_line_without_pid_is_not_a_record() {
        // Logged just before the child exists.
        assert_eq!(
            parse_line("2024-05-01 10:00:00 [INFO] Launching child[0] frames=1-50").unwrap(),
            None
        );
    }

    #[test]
    fn test_progress_from_relayed_child_output() {
        assert_eq!(
            parse_line("2024-05-01 10:00:01 [INFO] [1001 STDOUT] PROGRESS:  0;00;00;24 (25): 0 Seconds")
                .unwrap(),
            Some(LogRecord::Progress {
                pid: 1001,
                frame: 25
            })
        );
    }

    #[test]
    fn test_progress_banner_without_frame_is_ignored() {
        assert_eq!(
            parse_line("[1001 STDOUT] PROGRESS:  Total Time Elapsed: 3 Seconds").unwrap(),
            None
        );
        assert_eq!(parse_line("[1001 STDERR] some warning").unwrap(), None);
    }

    #[test]
    fn test_child_output_never_parsed_as_runner_record() {
        assert_eq!(
            parse_line("[1001 STDOUT] Run complete rc=0").unwrap(),
            None
        );
    }

    #[test]
    fn test_run_complete_and_runner_pid() {
        assert_eq!(
            parse_line("2024-05-01 10:05:00 [INFO] Run complete rc=143").unwrap(),
            Some(LogRecord::RunComplete { rc: 143 })
        );
        assert_eq!(
            parse_line("Run complete rc=-1").unwrap(),
            Some(LogRecord::RunComplete { rc: -1 })
        );
        assert_eq!(
            parse_line("2024-05-01 10:00:00 [INFO] Runner pid=999").unwrap(),
            Some(LogRecord::RunnerPid { pid: 999 })
        );
    }

    #[test]
    fn test_anomalies() {
        assert!(parse_line("Launched child[0] pid=abc frames=1-50").is_err());
        assert!(parse_line("Launched child[0] pid=7 frames=50-1").is_err());
        assert!(parse_line("Run complete rc=abc").is_err());
        assert!(parse_line("Run complete rc=99999999999").is_err());
        assert!(parse_line("Launched child[0] pid=0 frames=1-2").is_err());
    }

    #[test]
    fn test_structured_events() {
        assert_eq!(
            parse_line(r#"{"v":1,"event":"child_launched","index":2,"pid":77,"start":10,"end":19}"#)
                .unwrap(),
            Some(LogRecord::ChildLaunched {
                index: 2,
                pid: 77,
                start: 10,
                end: 19
            })
        );
        assert_eq!(
            parse_line(r#"2024-05-01 10:00:00 [INFO] {"v":1,"event":"progress","pid":77,"frame":12}"#)
                .unwrap(),
            Some(LogRecord::Progress { pid: 77, frame: 12 })
        );
        assert_eq!(
            parse_line(r#"{"v":1,"event":"run_complete","rc":0}"#).unwrap(),
            Some(LogRecord::RunComplete { rc: 0 })
        );
        assert_eq!(
            parse_line(r#"{"v":1,"event":"runner","pid":5}"#).unwrap(),
            Some(LogRecord::RunnerPid { pid: 5 })
        );
    }

    #[test]
    fn test_structured_anomalies() {
        assert!(parse_line(r#"{"v":2,"event":"run_complete","rc":0}"#).is_err());
        assert!(parse_line(r#"{"v":1,"event":"exploded"}"#).is_err());
        assert!(parse_line(r#"{"v":1,"event":"progress","pid":0,"frame":1}"#).is_err());
        assert!(parse_line("{not json").is_err());
    }

    #[test]
    fn test_oversized_frame_range_is_an_anomaly() {
        let err = parse_line("Launched child[0] pid=1001 frames=0-9223372036854775807").unwrap_err();
        assert_eq!(err.reason, "frame range too large");
        assert!(parse_line(
            r#"{"v":1,"event":"child_launched","index":0,"pid":5,"start":-9223372036854775808,"end":0}"#
        )
        .is_err());
        assert!(parse_line("Launched child[0] pid=1001 frames=1-9223372036854775807").is_ok());
        assert!(parse_all("Launched child[0] pid=1001 frames=0-9223372036854775807\n").is_empty());
    }

    #[test]
    fn test_parse_all_skips_bad_lines() {
        let text = "\
Runner pid=10
Launched child[0] pid=11 frames=1-10
Launched child[1] pid=abc frames=11-20
garbage line
[11 STDOUT] PROGRESS:  0;00;00;04 (5): 0 Seconds
Run complete rc=0
";
        assert_eq!(
            parse_all(text),
            vec![
                LogRecord::RunnerPid { pid: 10 },
                LogRecord::ChildLaunched {
                    index: 0,
                    pid: 11,
                    start: 1,
                    end: 10
                },
                LogRecord::Progress { pid: 11, frame: 5 },
                LogRecord::RunComplete { rc: 0 },
            ]
        );
    }
}
