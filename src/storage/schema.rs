//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            total INTEGER NOT NULL DEFAULT 0,
            executed INTEGER NOT NULL DEFAULT 0,
            pass INTEGER NOT NULL DEFAULT 0,
            fail INTEGER NOT NULL DEFAULT 0,
            pending INTEGER NOT NULL DEFAULT 0,
            error INTEGER NOT NULL DEFAULT 0,
            duration REAL,
            config_snapshot TEXT NOT NULL DEFAULT '{}',
            stats_snapshot TEXT,
            -- pid of the process writing the run while it is open
            owner_pid INTEGER
        );

        CREATE TABLE IF NOT EXISTS run_scripts (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            sequence INTEGER NOT NULL,
            file_name TEXT NOT NULL,
            execution_timestamp TEXT NOT NULL,
            duration REAL NOT NULL,
            verdict TEXT NOT NULL,
            console_text TEXT NOT NULL DEFAULT '',
            UNIQUE (run_id, sequence)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_start ON runs(start_time);
        CREATE INDEX IF NOT EXISTS idx_runs_label ON runs(label);
        CREATE INDEX IF NOT EXISTS idx_run_scripts_run ON run_scripts(run_id, sequence);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
