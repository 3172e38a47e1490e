//! scriptseq -- sequential test-script orchestrator for bench validation.
//!
//! Scripts run one at a time as child processes. Their output is streamed to
//! observers and classified into a verdict, and every run is recorded in a
//! local SQLite history.

pub mod access;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod events;
pub mod runner;
pub mod storage;

use anyhow::Result;

use crate::config::StorageConfig;
use crate::storage::{HistoryStore, RetryPolicy};

/// Open the history database named by `config`.
pub fn open_history(config: &StorageConfig) -> Result<HistoryStore> {
    tracing::debug!(db_path = %config.db_path.display(), "opening history database");
    let pool = storage::open_pool(&config.db_path)?;
    Ok(HistoryStore::new(pool, RetryPolicy::from_config(config)))
}
