mod command;
mod config;
mod console;
mod data_dir;
mod discovery;
mod events;
mod installer;
mod interpreter;
mod job;
mod launcher;
mod lifecycle;
mod log_tail;
mod monitor;
mod pid;
mod process_control;
mod progress;
mod signals;
mod status;
mod supervisor;

use clap::{Parser, Subcommand};
use config::SupervisorConfig;
use console::ConsoleOutcome;
use data_dir::{DataDir, SessionLock};
use progress::{RunState, RunStatus};
use status::StatusFile;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use supervisor::Supervisor;

/// Launch, monitor, pause, resume and stop local render jobs run by an
/// external worker script, reading its progress from the worker's log.
#[derive(Parser, Debug)]
#[command(name = "render-supervisor", version, about)]
pub struct Cli {
    /// Config file path (default: <data dir>/supervisor.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Extra logging (poll ticks, parse anomalies, signal delivery)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors; no log relay in the console
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the worker bundle into the data directory
    Install {
        /// Directory holding the worker script and its package
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Launch a render job and supervise it
    Run {
        /// Job description (TOML)
        #[arg(long)]
        job: PathBuf,
        /// Skip refreshing the installed bundle before launching
        #[arg(long)]
        no_install: bool,
        /// Bundle source directory (overrides config)
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Attach to a render that is already running
    Monitor,
    /// Suspend the running render's processes
    Pause,
    /// Continue a paused render
    Resume,
    /// Stop the running render (terminate, then kill after a grace period)
    Stop {
        /// Keep watching the log until the worker reports how it ended
        #[arg(long)]
        wait: bool,
    },
    /// Print the last known run status
    Status {
        /// Print the raw status JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the bundle, interpreter and renderer setup
    Doctor,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "render_supervisor=debug"
    } else if quiet {
        "render_supervisor=warn"
    } else {
        "render_supervisor=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Resolve config and data dir: `--data-dir` beats `[paths] data_dir`.
fn load_settings(cli: &Cli) -> Result<(SupervisorConfig, DataDir), String> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => cli
            .data_dir
            .clone()
            .unwrap_or_else(data_dir::default_root)
            .join("supervisor.toml"),
    };
    let mut config = match &cli.config {
        Some(path) => SupervisorConfig::load(path),
        None => SupervisorConfig::load_or_default(&config_path),
    }
    .map_err(|e| e.to_string())?;
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir = Some(dir.clone());
    }
    let data_dir = DataDir::from_config(&config.paths, &config.bundle);
    data_dir
        .init()
        .map_err(|e| format!("failed to create {}: {e}", data_dir.root().display()))?;
    Ok((config, data_dir))
}

/// Where to install the bundle from: flag, then config, then `bundle/` next to the binary.
fn bundle_source(flag: Option<&Path>, config: &SupervisorConfig) -> Option<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.bundle.source_dir.clone())
        .or_else(|| {
            let exe = std::env::current_exe().ok()?;
            let dir = exe.parent()?.join("bundle");
            dir.is_dir().then_some(dir)
        })
}

fn install(source: &Path, data_dir: &DataDir) -> Result<(), String> {
    let report = installer::install_bundle(
        &source.join(data_dir.script_name()),
        &source.join(data_dir.package_name()),
        &data_dir.script(),
        &data_dir.package_dir(),
    )
    .map_err(|e| e.to_string())?;
    println!(
        "Installed bundle to {} ({} files{})",
        data_dir.bundle_dir().display(),
        report.files_copied,
        if report.replaced_previous {
            ", replaced previous install"
        } else {
            ""
        }
    );
    Ok(())
}

/// Rebuild the current run's state from the log, for commands that run
/// outside the supervising session.
fn state_from_log(data_dir: &DataDir) -> (RunState, u64) {
    let baseline = match StatusFile::new(data_dir.status()).read() {
        Ok(Some(data)) => data.log_baseline,
        Ok(None) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable status file");
            0
        }
    };
    let mut state = RunState::default();
    match log_tail::read_tail(&data_dir.log_file(), u64::MAX, baseline) {
        Ok(tail) => state.apply_all(&events::parse_all(&tail.text)),
        Err(e) => tracing::warn!(error = %e, "failed to read log"),
    }
    (state, baseline)
}

fn exit_code_for(outcome: ConsoleOutcome) -> ExitCode {
    match outcome {
        ConsoleOutcome::Finished(RunStatus::Completed) | ConsoleOutcome::Detached(_) => {
            ExitCode::SUCCESS
        }
        ConsoleOutcome::Finished(RunStatus::Stopped) => ExitCode::from(130),
        ConsoleOutcome::Finished(RunStatus::Indeterminate) => ExitCode::from(2),
        ConsoleOutcome::Finished(_) => ExitCode::FAILURE,
    }
}

fn take_session_lock(data_dir: &DataDir) -> Result<SessionLock, String> {
    SessionLock::acquire(&data_dir.lock()).map_err(|e| e.to_string())
}

async fn dispatch(cli: Cli) -> Result<ExitCode, String> {
    let (config, data_dir) = load_settings(&cli)?;
    tracing::debug!(root = %data_dir.root().display(), "data directory");

    match &cli.command {
        Commands::Install { source } => {
            let source = bundle_source(source.as_deref(), &config)
                .ok_or("no bundle source: pass --source or set [bundle] source_dir")?;
            install(&source, &data_dir)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            job,
            no_install,
            source,
        } => {
            let job = job::RunConfiguration::load(job).map_err(|e| e.to_string())?;
            let _lock = take_session_lock(&data_dir)?;
            if !no_install {
                match bundle_source(source.as_deref(), &config) {
                    Some(source) => install(&source, &data_dir)?,
                    None => tracing::info!("no bundle source configured, using installed bundle"),
                }
            }
            let mut supervisor =
                Supervisor::new(config, data_dir, process_control::platform_signaller());
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let receipt = supervisor.launch(&job, tx).await.map_err(|e| e.to_string())?;
            println!(
                "Launched render at {}",
                receipt.launched_at.with_timezone(&chrono::Local).format("%H:%M:%S")
            );
            let outcome = console::run_console(supervisor, rx, cli.quiet).await;
            Ok(exit_code_for(outcome))
        }
        Commands::Monitor => {
            let _lock = take_session_lock(&data_dir)?;
            let mut supervisor =
                Supervisor::new(config, data_dir, process_control::platform_signaller());
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            supervisor.attach(tx).await;
            let outcome = console::run_console(supervisor, rx, cli.quiet).await;
            Ok(exit_code_for(outcome))
        }
        Commands::Pause | Commands::Resume => {
            let (state, _) = state_from_log(&data_dir);
            let signaller = process_control::platform_signaller();
            let pausing = matches!(cli.command, Commands::Pause);
            let report = if pausing {
                lifecycle::pause(signaller.as_ref(), &state, &data_dir.pid_file())
            } else {
                lifecycle::resume(signaller.as_ref(), &state, &data_dir.pid_file())
            }
            .map_err(|e| e.to_string())?;
            println!(
                "{} {} process(es)",
                if pausing { "Paused" } else { "Resumed" },
                report.delivered.len()
            );
            if !report.all_delivered() {
                eprintln!("{} process(es) could not be signalled:", report.failed.len());
                for (pid, e) in &report.failed {
                    eprintln!("  {pid}: {e}");
                }
            }
            Ok(if report.delivered.is_empty() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Stop { wait } => {
            let (_, baseline) = state_from_log(&data_dir);
            let signaller = process_control::platform_signaller();
            let sequence = lifecycle::StopSequence {
                pid_file: data_dir.pid_file(),
                log_file: data_dir.log_file(),
                log_floor: baseline,
                children_file: data_dir.children_pid_file(),
                stop_log: data_dir.stop_log(),
                grace: config.stop.grace(),
                poll: config.stop.poll(),
            };
            let report = sequence
                .spawn(signaller)
                .await
                .map_err(|e| format!("stop task failed: {e}"))?;
            match &report.runner {
                Some((pid, outcome)) => println!("Runner {pid}: {outcome:?}"),
                None => println!("No runner PID file found"),
            }
            for (pid, outcome) in &report.children {
                println!("Child {pid}: {outcome:?}");
            }
            if !wait {
                return Ok(ExitCode::SUCCESS);
            }
            let _lock = take_session_lock(&data_dir)?;
            let mut supervisor =
                Supervisor::new(config, data_dir, process_control::platform_signaller());
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            supervisor.attach(tx).await;
            supervisor.expect_stop();
            let outcome = console::run_console(supervisor, rx, true).await;
            Ok(exit_code_for(outcome))
        }
        Commands::Status { json } => {
            let status_file = StatusFile::new(data_dir.status());
            let Some(data) = status_file.read().map_err(|e| e.to_string())? else {
                println!("No run recorded in {}", data_dir.root().display());
                return Ok(ExitCode::SUCCESS);
            };
            if *json {
                let text = serde_json::to_string_pretty(&data).map_err(|e| e.to_string())?;
                println!("{text}");
                return Ok(ExitCode::SUCCESS);
            }
            println!("Status:   {} ({:.1}%)", data.status, data.percent);
            if let Some(pid) = data.supervising_pid.or(pid::read_pid_file(&data_dir.pid_file())) {
                let alive = process_control::platform_signaller().is_alive(pid);
                println!("Runner:   {pid} ({})", if alive { "alive" } else { "gone" });
            }
            for child in &data.children {
                println!(
                    "Child:    {} frames {}-{} ({}/{})",
                    child.pid,
                    child.range_start,
                    child.range_end,
                    child.contribution(),
                    child.total()
                );
            }
            if let Some(rc) = data.exit_code {
                println!("Exit:     rc={rc}");
            }
            println!(
                "Updated:  {}",
                data.last_update.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => Ok(doctor(&config, &data_dir)),
    }
}

fn doctor(config: &SupervisorConfig, data_dir: &DataDir) -> ExitCode {
    let mut healthy = true;
    println!("Data dir:    {}", data_dir.root().display());

    let script = data_dir.script();
    let package = data_dir.package_dir();
    if script.is_file() && package.is_dir() {
        println!("Bundle:      installed ({})", data_dir.bundle_dir().display());
    } else {
        healthy = false;
        println!("Bundle:      MISSING (run `install`)");
    }

    match interpreter::resolve(&config.interpreter) {
        Ok(interp) => println!("Interpreter: {interp}"),
        Err(e) => {
            healthy = false;
            println!("Interpreter: {e}");
        }
    }

    let renderers = discovery::renderer_candidates(None);
    match renderers.first() {
        Some(first) => println!("Renderer:    {}", first.display()),
        None => println!("Renderer:    not found (set overrides.renderer in the job)"),
    }
    for extra in renderers.iter().skip(1) {
        println!("             also {}", extra.display());
    }

    match pid::read_pid_file(&data_dir.pid_file()) {
        Some(pid) => println!("Runner PID:  {pid}"),
        None => println!("Runner PID:  none"),
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
