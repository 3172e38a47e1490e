//! Observer channel -- ordered, asynchronous events from the run worker.
//!
//! Each subscriber gets its own unbounded queue, so emitting never blocks the
//! worker and every subscriber sees events in production order.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::classifier::Verdict;
use crate::controller::state::ExecutionState;
use crate::storage::RunSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Option<i64>,
        label: String,
        total: u32,
    },
    StateChanged {
        state: ExecutionState,
    },
    ScriptStarted {
        sequence: u32,
        position: usize,
        name: String,
    },
    Progress {
        done: u32,
        total: u32,
    },
    ConsoleLine {
        sequence: u32,
        line: String,
    },
    ScriptResult {
        sequence: u32,
        name: String,
        duration_secs: f64,
        verdict: Verdict,
    },
    BreakpointHit {
        position: usize,
    },
    RunComplete {
        summary: RunSummary,
    },
    Error {
        message: String,
        /// The run was aborted by this error.
        fatal: bool,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Fan-out sender shared by the controller and its worker.
#[derive(Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<RunEvent>>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn emit(&self, event: RunEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
