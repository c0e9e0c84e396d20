/// Interpreter resolution for the worker script.
///
/// Priority: an explicit path that exists, then an explicit command validated
/// by a version probe, then platform candidates in order.
use crate::config::InterpreterConfig;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Outputs produced by OS aliases that only point at an installer.
const STUB_MARKERS: &[&str] = &["Microsoft Store", "was not found", "App execution aliases"];

/// A resolved interpreter: program plus leading arguments (e.g. `py -3`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: String,
    pub args: Vec<String>,
}

impl Interpreter {
    /// Split a command string like "py -3" into program and arguments.
    pub fn from_command(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Full argv prefix (program followed by its fixed arguments).
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

#[derive(Debug)]
pub enum InterpreterError {
    /// No explicit setting or candidate produced a valid version probe.
    NotFound { tried: Vec<String> },
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpreterError::NotFound { tried } => write!(
                f,
                "no usable Python 3 interpreter found (tried: {}); set [interpreter] path or command",
                if tried.is_empty() {
                    "nothing".to_string()
                } else {
                    tried.join(", ")
                }
            ),
        }
    }
}

impl std::error::Error for InterpreterError {}

/// Platform default candidate commands, in priority order.
pub fn default_candidates() -> Vec<String> {
    let list: &[&str] = if cfg!(windows) {
        &["py -3", "python", "python3"]
    } else if cfg!(target_os = "macos") {
        &[
            "/opt/homebrew/bin/python3",
            "/usr/local/bin/python3",
            "/usr/bin/python3",
            "python3",
        ]
    } else {
        &["python3", "python"]
    };
    list.iter().map(|s| s.to_string()).collect()
}

/// Resolve the interpreter to run the worker with.
pub fn resolve(config: &InterpreterConfig) -> Result<Interpreter, InterpreterError> {
    let timeout = Duration::from_secs(config.probe_timeout_secs.max(1));
    let mut tried = Vec::new();

    if let Some(path) = &config.path {
        if path.exists() {
            tracing::info!(path = %path.display(), "using configured interpreter path");
            return Ok(Interpreter {
                program: path.to_string_lossy().to_string(),
                args: Vec::new(),
            });
        }
        tracing::warn!(path = %path.display(), "configured interpreter path does not exist");
        tried.push(path.display().to_string());
    }

    if let Some(command) = config.command.as_deref().filter(|c| !c.trim().is_empty()) {
        if let Some(interp) = validated(command, &config.version_marker, timeout) {
            return Ok(interp);
        }
        tried.push(command.to_string());
    }

    let candidates = if config.candidates.is_empty() {
        default_candidates()
    } else {
        config.candidates.clone()
    };
    for candidate in &candidates {
        if let Some(interp) = validated(candidate, &config.version_marker, timeout) {
            return Ok(interp);
        }
        tried.push(candidate.clone());
    }

    Err(InterpreterError::NotFound { tried })
}

fn validated(command: &str, marker: &str, timeout: Duration) -> Option<Interpreter> {
    let interp = Interpreter::from_command(command)?;
    let output = probe(&interp, timeout)?;
    if accepts_version_output(&output, marker) {
        tracing::info!(interpreter = %interp, version = %output.trim(), "interpreter validated");
        Some(interp)
    } else {
        tracing::debug!(command, output = %output.trim(), "interpreter probe rejected");
        None
    }
}

/// Whether a `--version` probe output identifies a real interpreter.
pub fn accepts_version_output(output: &str, marker: &str) -> bool {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return false;
    }
    if STUB_MARKERS.iter().any(|m| trimmed.contains(m)) {
        return false;
    }
    trimmed.starts_with(marker)
}

/// Run `<interpreter> --version`, returning combined stdout+stderr.
///
/// Returns `None` if the process cannot be started or does not exit within `timeout`.
pub fn probe(interp: &Interpreter, timeout: Duration) -> Option<String> {
    let mut child = Command::new(&interp.program)
        .args(&interp.args)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(interpreter = %interp, "version probe timed out");
                return None;
            }
        }
    }

    let mut text = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut text);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut text);
    }
    Some(text)
}
