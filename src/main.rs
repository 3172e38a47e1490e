use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use scriptseq::access::{authorize, LocalSession, Permission, Session};
use scriptseq::config::{AppConfig, LoggingConfig};
use scriptseq::controller::{BreakpointSet, Controller, ExecutionState, RunRequest, ScriptQueue};
use scriptseq::events::RunEvent;
use scriptseq::storage::{RunQuery, RunSummary};

#[derive(Parser)]
#[command(
    name = "scriptseq",
    about = "Sequential test-script orchestrator with breakpoints and run history",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides ./scriptseq.toml)
    #[arg(long, global = true, env = "SCRIPTSEQ_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scripts in order, recording the run in history
    Run {
        /// Scripts to run, in order
        #[arg(required_unless_present = "manifest", conflicts_with = "manifest")]
        scripts: Vec<PathBuf>,

        /// Read the queue (and breakpoints marked with `*`) from a manifest
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Label stored with the run
        #[arg(long, default_value = "manual")]
        label: String,

        /// Pause before the script at this zero-based position (repeatable)
        #[arg(long = "break", value_name = "POSITION")]
        breakpoints: Vec<usize>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Browse and maintain run history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List runs, newest first
    Runs {
        /// Runs started at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        since: Option<DateTime<Utc>>,

        /// Runs started before this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        until: Option<DateTime<Utc>>,

        /// Only runs whose label contains this text
        #[arg(long)]
        label: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// List the scripts of one run
    Scripts {
        run_id: i64,

        #[arg(long)]
        json: bool,
    },

    /// Print the captured console output of one script
    Console { script_id: i64 },

    /// Delete a run and its script results
    Delete { run_id: i64 },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{}' is neither RFC 3339 nor YYYY-MM-DD", s))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    let session = LocalSession;

    match cli.command {
        Commands::Run {
            scripts,
            manifest,
            label,
            breakpoints,
            json,
        } => {
            authorize(&session, Permission::Execute)?;
            let (queue, mut marks) = match manifest {
                Some(path) => ScriptQueue::from_manifest(&path)?,
                None => (ScriptQueue::from_paths(scripts), BreakpointSet::new()),
            };
            marks.extend(&breakpoints.into_iter().collect::<BreakpointSet>());
            return run(&config, &session, queue, marks, label, json).await;
        }
        Commands::History { action } => history(&config, &session, action)?,
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run(
    config: &AppConfig,
    session: &dyn Session,
    queue: ScriptQueue,
    breakpoints: BreakpointSet,
    label: String,
    json: bool,
) -> Result<ExitCode> {
    if queue.is_empty() {
        bail!("no scripts to run");
    }
    let names: Vec<String> = queue.iter().map(|e| e.file_name()).collect();
    for position in breakpoints.iter() {
        if position >= queue.len() {
            tracing::warn!(position, "breakpoint beyond the end of the queue is ignored");
        }
    }

    let store = scriptseq::open_history(&config.storage)?;
    let ctl = Controller::from_config(config, Some(store))?;
    ctl.set_breakpoints(breakpoints)?;
    let mut events = ctl.subscribe();
    ctl.start(RunRequest {
        label,
        queue,
        config_snapshot: config.snapshot(),
    })?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let awaiting_input = stdin_open && ctl.state() == ExecutionState::PausedAtBreakpoint;
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let done = matches!(event, RunEvent::RunComplete { .. });
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    render_event(&event, &names);
                }
                if !stdin_open && matches!(event, RunEvent::BreakpointHit { .. }) {
                    // Nobody to answer the prompt.
                    resume_quietly(&ctl);
                }
                if done {
                    break;
                }
            }
            line = stdin.next_line(), if awaiting_input => {
                match line.context("failed to read stdin")? {
                    Some(answer) if answer.trim().eq_ignore_ascii_case("s") => {
                        authorize(session, Permission::Control)?;
                        if let Err(e) = ctl.stop() {
                            tracing::debug!(error = %e, "stop skipped");
                        }
                    }
                    Some(_) => {
                        authorize(session, Permission::Control)?;
                        resume_quietly(&ctl);
                    }
                    None => {
                        stdin_open = false;
                        resume_quietly(&ctl);
                    }
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("interrupted, stopping run");
                if let Err(e) = ctl.stop() {
                    tracing::debug!(error = %e, "stop after interrupt");
                }
            }
        }
    }

    let Some(summary) = ctl.wait().await else {
        bail!("run did not complete");
    };
    let failed = summary.counts.fail > 0 || summary.counts.error > 0 || summary.aborted;
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Resume after a breakpoint; a run that is already stopping is left alone.
fn resume_quietly(ctl: &Controller) {
    if let Err(e) = ctl.resume() {
        tracing::debug!(error = %e, "resume skipped");
    }
}

fn render_event(event: &RunEvent, names: &[String]) {
    match event {
        RunEvent::RunStarted { run_id, label, total } => match run_id {
            Some(id) => println!("Run #{} '{}': {} script(s)", id, label, total),
            None => println!("Run '{}' (not recorded): {} script(s)", label, total),
        },
        RunEvent::ScriptStarted {
            sequence, name, ..
        } => println!("[{}/{}] {}", sequence, names.len(), name),
        RunEvent::ConsoleLine { line, .. } => println!("    | {}", line),
        RunEvent::ScriptResult {
            verdict,
            duration_secs,
            ..
        } => println!("    -> {} ({:.2}s)", verdict, duration_secs),
        RunEvent::BreakpointHit { position } => {
            let name = names.get(*position).map(String::as_str).unwrap_or("?");
            println!(
                "Breakpoint before #{} ({}). Enter to continue, 's' to stop:",
                position, name
            );
        }
        RunEvent::Error { message, fatal } => {
            if *fatal {
                eprintln!("fatal: {}", message);
            } else {
                eprintln!("error: {}", message);
            }
        }
        RunEvent::RunComplete { summary } => print_summary(summary),
        RunEvent::StateChanged { .. } | RunEvent::Progress { .. } => {}
    }
}

fn print_summary(summary: &RunSummary) {
    let outcome = if summary.aborted {
        "ABORTED"
    } else if summary.stopped {
        "STOPPED"
    } else {
        "COMPLETED"
    };
    println!("\n=== Run {} ===", outcome);
    println!("{:<10} | {:>5}", "Verdict", "Count");
    println!("{:-<10}-|-{:->5}", "", "");
    println!("{:<10} | {:>5}", "PASS", summary.counts.pass);
    println!("{:<10} | {:>5}", "FAIL", summary.counts.fail);
    println!("{:<10} | {:>5}", "PENDING", summary.counts.pending);
    println!("{:<10} | {:>5}", "ERROR", summary.counts.error);
    println!(
        "Executed {}/{} in {:.2}s, pass rate {:.1}%",
        summary.executed,
        summary.total,
        summary.elapsed_secs,
        summary.pass_rate() * 100.0
    );
}

fn history(config: &AppConfig, session: &dyn Session, action: HistoryAction) -> Result<()> {
    let store = scriptseq::open_history(&config.storage)?;

    match action {
        HistoryAction::Runs {
            since,
            until,
            label,
            limit,
            json,
        } => {
            authorize(session, Permission::ReadHistory)?;
            let runs = store.query_runs(&RunQuery {
                since,
                until,
                label,
                limit: Some(limit),
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs found.");
            } else {
                println!(
                    "{:>5} | {:<20} | {:<24} | {:>9} | {:>4} | {:>4} | {:>4} | {:>4}",
                    "ID", "Label", "Started", "Executed", "PASS", "FAIL", "PEND", "ERR"
                );
                println!(
                    "{:->5}-|-{:-<20}-|-{:-<24}-|-{:->9}-|-{:->4}-|-{:->4}-|-{:->4}-|-{:->4}",
                    "", "", "", "", "", "", "", ""
                );
                for run in runs {
                    let executed = if run.is_closed() {
                        format!("{}/{}", run.executed, run.total)
                    } else {
                        "open".to_string()
                    };
                    println!(
                        "{:>5} | {:<20} | {:<24} | {:>9} | {:>4} | {:>4} | {:>4} | {:>4}",
                        run.id,
                        run.label,
                        run.start_time.format("%Y-%m-%d %H:%M:%S"),
                        executed,
                        run.counts.pass,
                        run.counts.fail,
                        run.counts.pending,
                        run.counts.error
                    );
                }
            }
        }
        HistoryAction::Scripts { run_id, json } => {
            authorize(session, Permission::ReadHistory)?;
            if store.get_run(run_id)?.is_none() {
                bail!("run {} not found", run_id);
            }
            let scripts = store.fetch_scripts_for_run(run_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&scripts)?);
            } else if scripts.is_empty() {
                println!("Run {} has no script results.", run_id);
            } else {
                println!(
                    "{:>6} | {:>3} | {:<30} | {:>9} | Verdict",
                    "ID", "Seq", "Script", "Seconds"
                );
                println!("{:->6}-|-{:->3}-|-{:-<30}-|-{:->9}-|-{:-<20}", "", "", "", "", "");
                for s in scripts {
                    println!(
                        "{:>6} | {:>3} | {:<30} | {:>9.2} | {}",
                        s.id, s.sequence, s.file_name, s.duration_secs, s.verdict
                    );
                }
            }
        }
        HistoryAction::Console { script_id } => {
            authorize(session, Permission::ReadHistory)?;
            match store.fetch_console_text(script_id)? {
                Some(text) => println!("{}", text),
                None => bail!("script result {} not found", script_id),
            }
        }
        HistoryAction::Delete { run_id } => {
            authorize(session, Permission::DeleteHistory)?;
            if store.delete_run(run_id)? {
                println!("Run {} deleted.", run_id);
            } else {
                bail!("run {} not found", run_id);
            }
        }
    }

    Ok(())
}
