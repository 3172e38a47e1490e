//! The run worker: one task per run, walking the queue script by script.
//!
//! Everything that belongs to a single run lives in [`RunContext`] and is
//! threaded through the loop; the controller only shares its control flags.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::queue::{BreakpointSet, ScriptEntry, ScriptQueue};
use super::state::ExecutionState;
use super::Shared;
use crate::classifier::{Classifier, Verdict};
use crate::events::RunEvent;
use crate::runner::ProcessOutcome;
use crate::storage::{HistoryStore, NewScriptResult, RunSummary, VerdictCounts};

/// Per-run state owned by the worker.
pub(crate) struct RunContext {
    pub(crate) label: String,
    pub(crate) queue: ScriptQueue,
    pub(crate) breakpoints: BreakpointSet,
    pub(crate) config_snapshot: String,
    pub(crate) cancel: CancellationToken,
    run_id: Option<i64>,
    counts: VerdictCounts,
    next_sequence: u32,
    started: Instant,
    stopped: bool,
}

impl RunContext {
    pub(crate) fn new(
        label: String,
        queue: ScriptQueue,
        breakpoints: BreakpointSet,
        config_snapshot: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label,
            queue,
            breakpoints,
            config_snapshot,
            cancel,
            run_id: None,
            counts: VerdictCounts::default(),
            next_sequence: 1,
            started: Instant::now(),
            stopped: false,
        }
    }

    fn total(&self) -> u32 {
        self.queue.len() as u32
    }

    fn summary(&self, aborted: bool) -> RunSummary {
        RunSummary {
            total: self.total(),
            executed: self.counts.executed(),
            counts: self.counts,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            stopped: self.stopped,
            aborted,
        }
    }
}

/// Drive one run from open to close. Never panics outward.
pub(crate) async fn drive(shared: Arc<Shared>, mut ctx: RunContext) -> RunSummary {
    let total = ctx.total();
    if let Some(store) = &shared.store {
        let label = ctx.label.clone();
        let snapshot = ctx.config_snapshot.clone();
        ctx.run_id = persist(&shared, store, "open_run", move |s| {
            s.open_run(&label, total, &snapshot)
        })
        .await;
    }
    info!(run_id = ?ctx.run_id, label = %ctx.label, total, "run started");
    shared.events.emit(RunEvent::RunStarted {
        run_id: ctx.run_id,
        label: ctx.label.clone(),
        total,
    });

    let outcome = AssertUnwindSafe(run_queue(&shared, &mut ctx))
        .catch_unwind()
        .await;
    let aborted = match outcome {
        Ok(()) => false,
        Err(panic) => {
            let message = format!("run worker failed: {}", panic_message(&panic));
            error!(run_id = ?ctx.run_id, %message, "aborting run");
            shared.events.emit(RunEvent::Error {
                message,
                fatal: true,
            });
            true
        }
    };

    let summary = ctx.summary(aborted);
    if let (Some(store), Some(run_id)) = (&shared.store, ctx.run_id) {
        let closing = summary.clone();
        persist(&shared, store, "close_run", move |s| s.close_run(run_id, &closing)).await;
    }

    info!(
        run_id = ?ctx.run_id,
        executed = summary.executed,
        pass = summary.counts.pass,
        fail = summary.counts.fail,
        pending = summary.counts.pending,
        error = summary.counts.error,
        stopped = summary.stopped,
        "run finished"
    );
    shared.set_state(ExecutionState::Completed);
    shared.events.emit(RunEvent::RunComplete {
        summary: summary.clone(),
    });
    summary
}

async fn run_queue(shared: &Shared, ctx: &mut RunContext) {
    let queue = ctx.queue.clone();
    let total = ctx.total();

    for entry in queue.iter() {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let pause_requested = *shared.pause.borrow();
        if pause_requested {
            shared.set_state(ExecutionState::PausedByUser);
            info!(position = entry.position, "paused before next script");
            if !wait_for_resume(shared, &ctx.cancel).await {
                break;
            }
            shared.set_state(ExecutionState::Running);
        }

        if ctx.breakpoints.contains(entry.position) {
            // Raise the flag before announcing, so a resume reacting to the
            // event is never lost.
            shared.pause.send_replace(true);
            shared.set_state(ExecutionState::PausedAtBreakpoint);
            info!(position = entry.position, script = %entry.file_name(), "breakpoint hit");
            shared.events.emit(RunEvent::BreakpointHit {
                position: entry.position,
            });
            if !wait_for_resume(shared, &ctx.cancel).await {
                break;
            }
            shared.set_state(ExecutionState::Running);
        }

        // A stop may have landed while parked at a gate.
        if ctx.cancel.is_cancelled() {
            break;
        }
        execute_script(shared, ctx, entry).await;
        shared.events.emit(RunEvent::Progress {
            done: ctx.counts.executed(),
            total,
        });
    }

    if ctx.cancel.is_cancelled() {
        ctx.stopped = true;
        shared.set_state(ExecutionState::Stopping);
    }
}

/// Park until the pause flag clears. Returns false when stopped instead.
async fn wait_for_resume(shared: &Shared, cancel: &CancellationToken) -> bool {
    let mut rx = shared.pause.subscribe();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = rx.wait_for(|paused| !*paused) => res.is_ok(),
    }
}

async fn execute_script(shared: &Shared, ctx: &mut RunContext, entry: &ScriptEntry) {
    let sequence = ctx.next_sequence;
    ctx.next_sequence += 1;
    let name = entry.file_name();

    shared.events.emit(RunEvent::ScriptStarted {
        sequence,
        position: entry.position,
        name: name.clone(),
    });
    let executed_at = Utc::now();
    let clock = Instant::now();

    let mut classifier = Classifier::new(shared.rules.clone());
    let result = {
        let events = &shared.events;
        let mut on_line = |line: &str| {
            classifier.observe(line);
            events.emit(RunEvent::ConsoleLine {
                sequence,
                line: line.to_string(),
            });
        };
        shared.launcher.run(entry, &mut on_line, &ctx.cancel).await
    };
    let duration_secs = clock.elapsed().as_secs_f64();

    let (verdict, console_text) = match result {
        Ok(outcome) => settle(shared, &name, outcome, classifier.finish()),
        Err(e) => {
            let message = e.to_string();
            warn!(sequence, script = %name, error = %message, "script could not run");
            shared.events.emit(RunEvent::Error {
                message: message.clone(),
                fatal: false,
            });
            (Verdict::Error(message), String::new())
        }
    };

    ctx.counts.record(&verdict);
    info!(sequence, script = %name, %verdict, duration_secs, "script finished");
    shared.events.emit(RunEvent::ScriptResult {
        sequence,
        name: name.clone(),
        duration_secs,
        verdict: verdict.clone(),
    });

    if let (Some(store), Some(run_id)) = (&shared.store, ctx.run_id) {
        let record = NewScriptResult {
            run_id,
            sequence,
            file_name: name,
            executed_at,
            duration_secs,
            verdict,
            console_text,
        };
        persist(shared, store, "append_script_result", move |s| {
            s.append_script_result(&record)
        })
        .await;
    }
}

/// Final verdict for a process that ran, folding in how it exited.
fn settle(
    shared: &Shared,
    name: &str,
    outcome: ProcessOutcome,
    classified: Verdict,
) -> (Verdict, String) {
    let produced_output = outcome.line_count > 0;

    if let Some(err) = &outcome.stream_error {
        warn!(script = %name, error = %err, "script output stream failed");
        shared.events.emit(RunEvent::Error {
            message: format!("{}: {}", name, err),
            fatal: false,
        });
        let verdict = if produced_output {
            classified
        } else {
            Verdict::Error(err.clone())
        };
        return (verdict, outcome.output);
    }

    let verdict = if outcome.terminated {
        if produced_output {
            classified
        } else {
            Verdict::Error("terminated before producing output".to_string())
        }
    } else if !outcome.success {
        let exit = match outcome.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "killed by signal".to_string(),
        };
        warn!(script = %name, %exit, "script exited abnormally");
        shared.events.emit(RunEvent::Error {
            message: format!("{} {}", name, exit),
            fatal: false,
        });
        if produced_output {
            classified
        } else {
            Verdict::Error(exit)
        }
    } else {
        classified
    };

    (verdict, outcome.output)
}

/// Run a history write on the blocking pool. Failures are logged and
/// reported as non-fatal errors; the run carries on without the record.
async fn persist<T, F>(shared: &Shared, store: &HistoryStore, what: &'static str, op: F) -> Option<T>
where
    F: FnOnce(&HistoryStore) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    let message = match tokio::task::spawn_blocking(move || op(&store)).await {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(e)) => format!("{} failed: {:#}", what, e),
        Err(e) => format!("{} task failed: {}", what, e),
    };
    error!(operation = what, %message, "history write lost");
    shared.events.emit(RunEvent::Error {
        message,
        fatal: false,
    });
    None
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
