//! Execution controller -- owns the queue, the breakpoints and the run state,
//! and drives one run at a time on a background worker task.
//!
//! Commands (`start`, `pause`, `resume`, `stop`) are cheap and never block on
//! script execution. The worker observes them at script boundaries, except
//! `stop`, which also terminates the in-flight process.

pub mod queue;
pub mod state;
mod worker;

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use queue::{BreakpointSet, ScriptEntry, ScriptQueue};
pub use state::ExecutionState;

use crate::classifier::ClassifierRules;
use crate::config::AppConfig;
use crate::events::{EventReceiver, EventSink, RunEvent};
use crate::runner::{ProcessRunner, RunnerSettings, ScriptLauncher};
use crate::storage::{HistoryStore, RunSummary};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("a run is already in progress")]
    RunInProgress,
    #[error("the script queue is empty")]
    EmptyQueue,
    #[error("no run is in progress (state: {0})")]
    NotRunning(ExecutionState),
    #[error("nothing to resume (state: {0})")]
    NotPaused(ExecutionState),
    #[error("breakpoints cannot change while a run is active")]
    BreakpointsLocked,
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub label: String,
    pub queue: ScriptQueue,
    /// Effective configuration, stored with the run record.
    pub config_snapshot: String,
}

/// State shared between the controller handle and its worker.
pub(crate) struct Shared {
    pub(crate) launcher: Arc<dyn ScriptLauncher>,
    pub(crate) rules: Arc<ClassifierRules>,
    pub(crate) store: Option<HistoryStore>,
    pub(crate) events: EventSink,
    pub(crate) state: watch::Sender<ExecutionState>,
    /// Pending or active pause. Cleared by `resume`.
    pub(crate) pause: watch::Sender<bool>,
    breakpoints: Mutex<BreakpointSet>,
    active: Mutex<ActiveRun>,
}

#[derive(Default)]
struct ActiveRun {
    cancel: Option<CancellationToken>,
    worker: Option<JoinHandle<RunSummary>>,
}

impl Shared {
    /// Publish a new state. Repeats are swallowed, and once a stop is in
    /// progress the only way out is `Completed`.
    pub(crate) fn set_state(&self, next: ExecutionState) {
        let mut prev = next;
        let changed = self.state.send_if_modified(|current| {
            prev = *current;
            if *current == next
                || (*current == ExecutionState::Stopping && next != ExecutionState::Completed)
            {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            if prev != next {
                debug!(from = %prev, to = %next, "state held while stopping");
            }
            return;
        }
        if !prev.can_transition_to(next) {
            warn!(from = %prev, to = %next, "unexpected state transition");
        }
        debug!(from = %prev, to = %next, "state changed");
        self.events.emit(RunEvent::StateChanged { state: next });
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveRun> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_breakpoints(&self) -> MutexGuard<'_, BreakpointSet> {
        self.breakpoints.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Build a controller. Runs left open by a previous crash are closed
    /// before anything else touches the store.
    pub fn new(
        launcher: Arc<dyn ScriptLauncher>,
        rules: Arc<ClassifierRules>,
        store: Option<HistoryStore>,
    ) -> Self {
        if let Some(store) = &store {
            match store.close_orphaned_runs() {
                Ok(0) => {}
                Ok(n) => info!(count = n, "closed runs left open by an earlier session"),
                Err(e) => warn!(error = %e, "failed to close orphaned runs"),
            }
        }

        let (state, _) = watch::channel(ExecutionState::Idle);
        let (pause, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                launcher,
                rules,
                store,
                events: EventSink::new(),
                state,
                pause,
                breakpoints: Mutex::new(BreakpointSet::new()),
                active: Mutex::new(ActiveRun::default()),
            }),
        }
    }

    /// Controller running real processes with the configured classifier.
    pub fn from_config(config: &AppConfig, store: Option<HistoryStore>) -> Result<Self> {
        let runner = ProcessRunner::new(RunnerSettings::from_config(&config.runner)?);
        let rules = ClassifierRules::new(&config.classifier)?;
        Ok(Self::new(Arc::new(runner), Arc::new(rules), store))
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ExecutionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ExecutionState> {
        self.shared.state.subscribe()
    }

    pub fn store(&self) -> Option<&HistoryStore> {
        self.shared.store.as_ref()
    }

    pub fn breakpoints(&self) -> BreakpointSet {
        self.shared.lock_breakpoints().clone()
    }

    /// Replace the breakpoint set. Only allowed between runs.
    pub fn set_breakpoints(&self, breakpoints: BreakpointSet) -> Result<(), ControlError> {
        let _active = self.shared.lock_active();
        if self.state().is_active() {
            return Err(ControlError::BreakpointsLocked);
        }
        *self.shared.lock_breakpoints() = breakpoints;
        Ok(())
    }

    /// Flip the breakpoint before `position`; returns whether it is now set.
    pub fn toggle_breakpoint(&self, position: usize) -> Result<bool, ControlError> {
        let _active = self.shared.lock_active();
        if self.state().is_active() {
            return Err(ControlError::BreakpointsLocked);
        }
        Ok(self.shared.lock_breakpoints().toggle(position))
    }

    /// Start a run on a new worker task. Must be called inside a tokio
    /// runtime. Returns as soon as the worker is spawned.
    pub fn start(&self, request: RunRequest) -> Result<(), ControlError> {
        if request.queue.is_empty() {
            return Err(ControlError::EmptyQueue);
        }

        let mut active = self.shared.lock_active();
        if self.state().is_active() {
            return Err(ControlError::RunInProgress);
        }

        let breakpoints = self.shared.lock_breakpoints().clone();
        let cancel = CancellationToken::new();
        info!(
            label = %request.label,
            scripts = request.queue.len(),
            breakpoints = breakpoints.len(),
            "starting run"
        );

        self.shared.pause.send_replace(false);
        self.shared.set_state(ExecutionState::Running);

        let ctx = worker::RunContext::new(
            request.label,
            request.queue,
            breakpoints,
            request.config_snapshot,
            cancel.clone(),
        );
        active.cancel = Some(cancel);
        active.worker = Some(tokio::spawn(worker::drive(self.shared.clone(), ctx)));
        Ok(())
    }

    /// Request a pause. Takes effect before the next script starts.
    pub fn pause(&self) -> Result<(), ControlError> {
        let _active = self.shared.lock_active();
        match self.state() {
            ExecutionState::Running => {
                self.shared.pause.send_replace(true);
                info!("pause requested");
                Ok(())
            }
            ExecutionState::PausedByUser | ExecutionState::PausedAtBreakpoint => Ok(()),
            other => Err(ControlError::NotRunning(other)),
        }
    }

    /// Continue a paused run, or withdraw a pause that has not taken effect.
    pub fn resume(&self) -> Result<(), ControlError> {
        let _active = self.shared.lock_active();
        let state = self.state();
        let pending = *self.shared.pause.borrow();
        match state {
            ExecutionState::PausedByUser | ExecutionState::PausedAtBreakpoint => {}
            ExecutionState::Running if pending => {}
            other => return Err(ControlError::NotPaused(other)),
        }
        self.shared.pause.send_replace(false);
        info!(from = %state, "resume requested");
        Ok(())
    }

    /// Stop the run: the in-flight script is terminated and nothing further
    /// is launched.
    pub fn stop(&self) -> Result<(), ControlError> {
        let active = self.shared.lock_active();
        let state = self.state();
        if !state.is_active() {
            return Err(ControlError::NotRunning(state));
        }
        if let Some(cancel) = &active.cancel {
            cancel.cancel();
        }
        self.shared.set_state(ExecutionState::Stopping);
        info!(from = %state, "stop requested");
        Ok(())
    }

    /// Wait for the current run to finish. `None` when no run was started
    /// since the last call.
    pub async fn wait(&self) -> Option<RunSummary> {
        let handle = self.shared.lock_active().worker.take()?;
        match handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "run worker did not finish cleanly");
                None
            }
        }
    }
}
