/// Command Builder: turns a validated run configuration into the worker's
/// command line and an OS-appropriate detached launch.
use crate::interpreter::Interpreter;
use crate::job::{ConcurrencyMode, FrameScope, RunConfiguration, TargetSelector};
use std::path::{Path, PathBuf};

/// File paths the worker is told to write to.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    pub script: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
}

/// Serialize a run configuration into worker flags, in a fixed order.
pub fn worker_args(job: &RunConfiguration, paths: &WorkerPaths) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut flag = |name: &str, value: String| {
        args.push(name.to_string());
        args.push(value);
    };

    flag("--project", path_arg(&job.project));
    flag("--output", path_arg(&job.output));
    flag("--log_file", path_arg(&paths.log_file));
    flag("--pid_file", path_arg(&paths.pid_file));

    match &job.target {
        TargetSelector::Composition(name) => flag("--comp", name.clone()),
        TargetSelector::QueueIndex(index) => flag("--rqindex", index.to_string()),
    }

    match &job.frames {
        FrameScope::Range { start, end } => {
            flag("--start", start.to_string());
            flag("--end", end.to_string());
        }
        FrameScope::Spec { frames, chunk } => {
            flag("--frames", frames.clone());
            if let Some(chunk) = chunk {
                flag("--chunk_size", chunk.size.to_string());
                flag("--index", chunk.index.to_string());
            }
        }
    }

    match &job.concurrency {
        ConcurrencyMode::Fixed(n) => flag("--concurrency", n.to_string()),
        ConcurrencyMode::Auto {
            max_concurrency,
            ram_per_process_gb,
            mfr_threads,
        } => {
            // 0 tells the worker to size the pool itself.
            flag("--concurrency", "0".to_string());
            flag("--max_concurrency", max_concurrency.to_string());
            flag("--ram_per_process_gb", ram_per_process_gb.to_string());
            if *mfr_threads > 0 {
                flag("--mfr_threads", mfr_threads.to_string());
            }
        }
    }

    let f = &job.features;
    flag("--sound", if f.sound { "ON" } else { "OFF" }.to_string());
    let toggles = [
        (f.disable_mfr, "--disable_mfr"),
        (f.no_scratch, "--no_scratch"),
        (!f.stage_project, "--no_stage_project"),
        (f.kill_on_fail, "--kill_on_fail"),
        (f.disable_affinity, "--disable_affinity"),
        (f.output_is_pattern, "--output_is_pattern"),
        (f.dry_run, "--dry_run"),
    ];
    for (on, name) in toggles {
        if on {
            args.push(name.to_string());
        }
    }

    let o = &job.overrides;
    let path_overrides = [
        ("--aerender_path", &o.renderer),
        ("--after_effects_dir", &o.after_effects_dir),
        ("--scratch_root", &o.scratch_root),
        ("--env_file", &o.env_file),
        ("--numa_map", &o.numa_map),
    ];
    for (name, value) in path_overrides {
        if let Some(path) = value {
            args.push(name.to_string());
            args.push(path_arg(path));
        }
    }
    if let Some(t) = &o.rs_template {
        args.push("--rs_template".to_string());
        args.push(t.clone());
    }
    if let Some(t) = &o.om_template {
        args.push("--om_template".to_string());
        args.push(t.clone());
    }

    args
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Target platform family for the detached launch form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// A generated script that must be written before the launch command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperScript {
    pub path: PathBuf,
    pub contents: String,
}

/// A fully built detached launch: one synchronous command that returns promptly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub wrapper: Option<WrapperScript>,
}

impl LaunchPlan {
    /// Build the detached invocation of `interpreter script worker_args...`.
    ///
    /// Windows goes through a generated `.cmd` wrapper at `wrapper_path` so the
    /// `start` command never sees nested quoting. Unix uses one `sh -c` with
    /// `nohup`, backgrounding and all standard streams discarded.
    pub fn build(
        platform: Platform,
        interpreter: &Interpreter,
        script: &Path,
        worker_args: &[String],
        wrapper_path: &Path,
    ) -> Self {
        let mut argv = interpreter.argv();
        argv.push(path_arg(script));
        argv.extend(worker_args.iter().cloned());

        match platform {
            Platform::Windows => {
                let line = argv
                    .iter()
                    .map(|a| cmd_quote(a))
                    .collect::<Vec<_>>()
                    .join(" ");
                let contents = format!("@echo off\r\n{line}\r\n");
                LaunchPlan {
                    program: "cmd".to_string(),
                    args: vec![
                        "/C".to_string(),
                        "start".to_string(),
                        // Empty window title; `start` treats the first quoted arg as one.
                        String::new(),
                        "/MIN".to_string(),
                        path_arg(wrapper_path),
                    ],
                    wrapper: Some(WrapperScript {
                        path: wrapper_path.to_path_buf(),
                        contents,
                    }),
                }
            }
            Platform::Unix => {
                let line = argv
                    .iter()
                    .map(|a| sh_quote(a))
                    .collect::<Vec<_>>()
                    .join(" ");
                LaunchPlan {
                    program: "sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        format!("nohup {line} </dev/null >/dev/null 2>&1 &"),
                    ],
                    wrapper: None,
                }
            }
        }
    }

    /// Human-readable form for logs and dry runs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// POSIX single-quote escaping.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// cmd.exe argument quoting: wrap in double quotes, double embedded quotes,
/// and escape `%` so the wrapper does not expand it.
pub fn cmd_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\"").replace('%', "%%"))
}
