/// Interactive console for `run` and `monitor`: prints progress, relays new
/// log lines and accepts `pause`, `resume`, `stop` and `detach` on stdin.
use crate::monitor::ProgressUpdate;
use crate::progress::RunStatus;
use crate::signals::{HostSignal, SignalHandler};
use crate::supervisor::Supervisor;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Lines shown when a new tail shares nothing with the previous one.
const FRESH_TAIL_LINES: usize = 10;

/// Commands typed at the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Pause,
    Resume,
    Stop,
    Detach,
    Status,
}

impl ConsoleCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "pause" | "p" => Some(ConsoleCommand::Pause),
            "resume" | "r" => Some(ConsoleCommand::Resume),
            "stop" | "s" => Some(ConsoleCommand::Stop),
            "detach" | "d" | "quit" | "q" => Some(ConsoleCommand::Detach),
            "status" | "" => Some(ConsoleCommand::Status),
            _ => None,
        }
    }
}

/// How the console session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleOutcome {
    Finished(RunStatus),
    Detached(RunStatus),
}

/// Lines of `next` that were not already shown as the end of `prev`.
pub fn fresh_lines<'a>(prev: &str, next: &'a str) -> Vec<&'a str> {
    let next_lines: Vec<&str> = next.lines().collect();
    let prev_lines: Vec<&str> = prev.lines().collect();
    let Some(last) = prev_lines.last() else {
        return tail_of(&next_lines, FRESH_TAIL_LINES);
    };
    // Anchor on the last shown line plus up to two lines before it.
    let anchor = prev_lines.len().min(3);
    let anchor_lines = &prev_lines[prev_lines.len() - anchor..];
    let found = next_lines.iter().enumerate().rev().find(|(i, line)| {
        *line == last
            && *i + 1 >= anchor
            && next_lines[*i + 1 - anchor..=*i] == *anchor_lines
    });
    match found {
        Some((i, _)) => next_lines[i + 1..].to_vec(),
        None => tail_of(&next_lines, FRESH_TAIL_LINES),
    }
}

fn tail_of<'a>(lines: &[&'a str], n: usize) -> Vec<&'a str> {
    lines[lines.len().saturating_sub(n)..].to_vec()
}

/// Drive the console until the run ends or the user detaches.
pub async fn run_console(
    mut supervisor: Supervisor,
    mut updates: mpsc::UnboundedReceiver<ProgressUpdate>,
    quiet: bool,
) -> ConsoleOutcome {
    let mut signals = SignalHandler::install();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut shown_tail = String::new();
    let mut shown: Option<(RunStatus, u32)> = None;

    println!("Commands: pause | resume | stop | detach | status");
    let outcome = loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    break ConsoleOutcome::Finished(supervisor.status());
                };
                if let Some(tail) = &update.tail {
                    if !quiet {
                        for line in fresh_lines(&shown_tail, tail) {
                            println!("  | {line}");
                        }
                    }
                    shown_tail = tail.clone();
                }
                let key = (update.status, update.percent.floor() as u32);
                if shown != Some(key) {
                    println!("[{}] {:.1}%", update.status, update.percent);
                    shown = Some(key);
                }
                if update.status.is_terminal() {
                    break ConsoleOutcome::Finished(update.status);
                }
            }
            signal = signals.recv() => match signal {
                HostSignal::Stop => {
                    println!("Stopping render (interrupt again to detach)...");
                    supervisor.stop();
                }
                HostSignal::Detach => break ConsoleOutcome::Detached(supervisor.status()),
            },
            line = stdin.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Pause) => match supervisor.pause() {
                        Ok(report) => println!("Paused {} process(es)", report.delivered.len()),
                        Err(e) => eprintln!("pause failed: {e}"),
                    },
                    Some(ConsoleCommand::Resume) => match supervisor.resume() {
                        Ok(report) => println!("Resumed {} process(es)", report.delivered.len()),
                        Err(e) => eprintln!("resume failed: {e}"),
                    },
                    Some(ConsoleCommand::Stop) => {
                        println!("Stopping render...");
                        supervisor.stop();
                    }
                    Some(ConsoleCommand::Detach) => {
                        break ConsoleOutcome::Detached(supervisor.status());
                    }
                    Some(ConsoleCommand::Status) => {
                        let snapshot = supervisor.snapshot();
                        println!(
                            "[{}] {:.1}% ({} worker(s) known)",
                            snapshot.status,
                            snapshot.percent(),
                            snapshot.children.len()
                        );
                    }
                    None => eprintln!("unknown command: {}", line.trim()),
                }
            }
        }
    };

    if let ConsoleOutcome::Detached(_) = outcome {
        println!("Detached; the render keeps running. Use `monitor` to reattach.");
    }
    supervisor.shutdown().await;
    outcome
}
