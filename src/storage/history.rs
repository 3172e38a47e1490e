//! Run history: one `runs` row per controller run, one `run_scripts` row per
//! executed script.
//!
//! The worker is the only writer while a run is active. Script rows are
//! append-only; aggregates are frozen once, by [`HistoryStore::close_run`].

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{with_busy_retry, Pool, RetryPolicy};
use crate::classifier::Verdict;

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Per-verdict script counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub pass: u32,
    pub fail: u32,
    pub pending: u32,
    pub error: u32,
}

impl VerdictCounts {
    pub fn record(&mut self, verdict: &Verdict) {
        self.add(verdict, 1);
    }

    pub fn add(&mut self, verdict: &Verdict, n: u32) {
        match verdict {
            Verdict::Pass => self.pass += n,
            Verdict::Fail => self.fail += n,
            Verdict::Pending => self.pending += n,
            Verdict::Error(_) => self.error += n,
        }
    }

    pub fn executed(&self) -> u32 {
        self.pass + self.fail + self.pending + self.error
    }
}

/// Aggregate outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u32,
    pub executed: u32,
    pub counts: VerdictCounts,
    pub elapsed_secs: f64,
    /// Ended by a stop request.
    pub stopped: bool,
    /// Ended by an unrecoverable worker failure.
    pub aborted: bool,
}

impl RunSummary {
    pub fn pass_rate(&self) -> f64 {
        if self.executed == 0 {
            return 0.0;
        }
        self.counts.pass as f64 / self.executed as f64
    }

    fn stats_snapshot(&self) -> String {
        serde_json::json!({
            "summary": self,
            "pass_rate": self.pass_rate(),
        })
        .to_string()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A persisted run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub label: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the run is open.
    pub end_time: Option<DateTime<Utc>>,
    pub total: u32,
    pub executed: u32,
    pub counts: VerdictCounts,
    pub duration_secs: Option<f64>,
    pub config_snapshot: String,
    pub stats_snapshot: Option<String>,
}

impl RunRecord {
    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// A persisted script result, without its console text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptResultRecord {
    pub id: i64,
    pub run_id: i64,
    pub sequence: u32,
    pub file_name: String,
    pub executed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub verdict: Verdict,
}

/// Script result as handed over by the worker.
#[derive(Debug, Clone)]
pub struct NewScriptResult {
    pub run_id: i64,
    pub sequence: u32,
    pub file_name: String,
    pub executed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub verdict: Verdict,
    pub console_text: String,
}

/// Filter for [`HistoryStore::query_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    /// Inclusive lower bound on start time.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on start time.
    pub until: Option<DateTime<Utc>>,
    /// Substring of the run label.
    pub label: Option<String>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn format_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width and UTC so that text comparison orders correctly.
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const RUN_COLUMNS: &str = "id, label, start_time, end_time, total, executed, pass, fail, \
                           pending, error, duration, config_snapshot, stats_snapshot";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    Ok(RunRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        start_time: parse_ts(2, &start)?,
        end_time: end.as_deref().map(|s| parse_ts(3, s)).transpose()?,
        total: row.get(4)?,
        executed: row.get(5)?,
        counts: VerdictCounts {
            pass: row.get(6)?,
            fail: row.get(7)?,
            pending: row.get(8)?,
            error: row.get(9)?,
        },
        duration_secs: row.get(10)?,
        config_snapshot: row.get(11)?,
        stats_snapshot: row.get(12)?,
    })
}

fn script_from_row(row: &Row<'_>) -> rusqlite::Result<ScriptResultRecord> {
    let executed_at: String = row.get(4)?;
    let verdict: String = row.get(6)?;
    Ok(ScriptResultRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        sequence: row.get(2)?,
        file_name: row.get(3)?,
        executed_at: parse_ts(4, &executed_at)?,
        duration_secs: row.get(5)?,
        verdict: verdict
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persists runs and per-script results.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool,
    retry: RetryPolicy,
    /// Recorded on every run this store opens.
    owner_pid: u32,
}

impl HistoryStore {
    pub fn new(pool: Pool, retry: RetryPolicy) -> Self {
        Self {
            pool,
            retry,
            owner_pid: std::process::id(),
        }
    }

    /// Record runs as owned by `pid` instead of the current process.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    /// Create an open run record and return its id.
    pub fn open_run(&self, label: &str, total: u32, config_snapshot: &str) -> Result<i64> {
        let conn = self.pool.get().context("Failed to get DB connection")?;
        let start = format_ts(&Utc::now());
        let id = with_busy_retry(&self.retry, "open_run", || {
            conn.execute(
                "INSERT INTO runs (label, start_time, total, config_snapshot, owner_pid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![label, start, total, config_snapshot, self.owner_pid],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("Failed to insert run")?;
        info!(run_id = id, %label, total, "run opened");
        Ok(id)
    }

    /// Append one script result. Rows are never updated afterwards.
    pub fn append_script_result(&self, result: &NewScriptResult) -> Result<i64> {
        let conn = self.pool.get().context("Failed to get DB connection")?;
        let executed_at = format_ts(&result.executed_at);
        let verdict = result.verdict.to_string();
        let id = with_busy_retry(&self.retry, "append_script_result", || {
            conn.execute(
                "INSERT INTO run_scripts (
                    run_id, sequence, file_name, execution_timestamp,
                    duration, verdict, console_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    result.run_id,
                    result.sequence,
                    result.file_name,
                    executed_at,
                    result.duration_secs,
                    verdict,
                    result.console_text,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .with_context(|| {
            format!(
                "Failed to save result for run {} sequence {}",
                result.run_id, result.sequence
            )
        })?;
        debug!(run_id = result.run_id, sequence = result.sequence, %verdict, "script result stored");
        Ok(id)
    }

    /// Freeze a run's aggregates and end time.
    pub fn close_run(&self, run_id: i64, summary: &RunSummary) -> Result<()> {
        let conn = self.pool.get().context("Failed to get DB connection")?;
        let end = format_ts(&Utc::now());
        let stats = summary.stats_snapshot();
        let changed = with_busy_retry(&self.retry, "close_run", || {
            conn.execute(
                "UPDATE runs SET end_time = ?2, executed = ?3, pass = ?4, fail = ?5,
                    pending = ?6, error = ?7, duration = ?8, stats_snapshot = ?9
                 WHERE id = ?1",
                params![
                    run_id,
                    end,
                    summary.executed,
                    summary.counts.pass,
                    summary.counts.fail,
                    summary.counts.pending,
                    summary.counts.error,
                    summary.elapsed_secs,
                    stats,
                ],
            )
        })
        .context("Failed to close run")?;
        if changed == 0 {
            anyhow::bail!("Run {} not found", run_id);
        }
        info!(run_id, executed = summary.executed, "run closed");
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                [run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Runs matching a date range and label filter, newest first.
    pub fn query_runs(&self, query: &RunQuery) -> Result<Vec<RunRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs
             WHERE (?1 IS NULL OR start_time >= ?1)
               AND (?2 IS NULL OR start_time < ?2)
               AND (?3 IS NULL OR label LIKE '%' || ?3 || '%')
             ORDER BY start_time DESC, id DESC
             LIMIT ?4",
            RUN_COLUMNS
        ))?;

        let since = query.since.as_ref().map(format_ts);
        let until = query.until.as_ref().map(format_ts);
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);

        let rows = stmt.query_map(params![since, until, query.label, limit], run_from_row)?;
        let mut runs = Vec::new();
        for r in rows {
            runs.push(r?);
        }
        Ok(runs)
    }

    pub fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.query_runs(&RunQuery {
            limit: Some(limit),
            ..RunQuery::default()
        })
    }

    /// Script results of a run, ordered by sequence.
    pub fn fetch_scripts_for_run(&self, run_id: i64) -> Result<Vec<ScriptResultRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, sequence, file_name, execution_timestamp, duration, verdict
             FROM run_scripts WHERE run_id = ?1 ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map([run_id], script_from_row)?;
        let mut scripts = Vec::new();
        for r in rows {
            scripts.push(r?);
        }
        Ok(scripts)
    }

    /// Full captured output of one script, stored as-is.
    pub fn fetch_console_text(&self, script_id: i64) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let text = conn
            .query_row(
                "SELECT console_text FROM run_scripts WHERE id = ?1",
                [script_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text)
    }

    /// Count a run's stored script results by verdict.
    pub fn verdict_counts_for_run(&self, run_id: i64) -> Result<VerdictCounts> {
        let conn = self.pool.get()?;
        verdict_counts(&conn, run_id)
    }

    /// Delete a run and, through the foreign key, its script results.
    pub fn delete_run(&self, run_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = with_busy_retry(&self.retry, "delete_run", || {
            conn.execute("DELETE FROM runs WHERE id = ?1", [run_id])
        })?;
        if changed > 0 {
            info!(run_id, "run deleted");
        }
        Ok(changed > 0)
    }

    /// Close runs left open by a process that died mid-run. Counts are
    /// rebuilt from the stored script results.
    ///
    /// Runs whose owning process is still alive are left alone; another
    /// process may be writing them right now.
    pub fn close_orphaned_runs(&self) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let open: Vec<(i64, u32, String, Option<u32>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, total, start_time, owner_pid FROM runs WHERE end_time IS NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        let orphans: Vec<(i64, u32, String)> = open
            .into_iter()
            .filter(|(run_id, _, _, owner)| match owner {
                Some(pid) if process_alive(*pid) => {
                    debug!(run_id, owner_pid = pid, "open run still owned by a live process");
                    false
                }
                _ => true,
            })
            .map(|(run_id, total, start, _)| (run_id, total, start))
            .collect();

        for (run_id, total, start) in &orphans {
            let counts = verdict_counts(&tx, *run_id)?;
            let last: Option<String> = tx.query_row(
                "SELECT MAX(execution_timestamp) FROM run_scripts WHERE run_id = ?1",
                [run_id],
                |row| row.get(0),
            )?;
            let end = last.unwrap_or_else(|| start.clone());
            let elapsed = match (parse_ts(0, start), parse_ts(0, &end)) {
                (Ok(s), Ok(e)) => (e - s).num_milliseconds().max(0) as f64 / 1000.0,
                _ => 0.0,
            };
            let summary = RunSummary {
                total: *total,
                executed: counts.executed(),
                counts,
                elapsed_secs: elapsed,
                stopped: false,
                aborted: true,
            };
            tx.execute(
                "UPDATE runs SET end_time = ?2, executed = ?3, pass = ?4, fail = ?5,
                    pending = ?6, error = ?7, duration = ?8, stats_snapshot = ?9
                 WHERE id = ?1",
                params![
                    run_id,
                    end,
                    summary.executed,
                    counts.pass,
                    counts.fail,
                    counts.pending,
                    counts.error,
                    summary.elapsed_secs,
                    summary.stats_snapshot(),
                ],
            )?;
            warn!(run_id, executed = summary.executed, "closed orphaned run");
        }

        tx.commit()?;
        Ok(orphans.len())
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks existence. EPERM still means the pid is taken.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    pid == std::process::id()
}

fn verdict_counts(conn: &rusqlite::Connection, run_id: i64) -> Result<VerdictCounts> {
    let mut stmt = conn.prepare(
        "SELECT verdict, COUNT(*) FROM run_scripts WHERE run_id = ?1 GROUP BY verdict",
    )?;
    let rows = stmt.query_map([run_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
    })?;

    let mut counts = VerdictCounts::default();
    for r in rows {
        let (label, n) = r?;
        match label.parse::<Verdict>() {
            Ok(v) => counts.add(&v, n),
            Err(e) => warn!(run_id, error = %e, "skipping unparseable verdict"),
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use chrono::Duration;

    /// Above any kernel pid_max, so never a live process.
    const GONE_PID: u32 = 999_999_999;

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("history.db")).unwrap();
        (dir, HistoryStore::new(pool, RetryPolicy::default()))
    }

    fn result(run_id: i64, sequence: u32, verdict: Verdict) -> NewScriptResult {
        NewScriptResult {
            run_id,
            sequence,
            file_name: format!("step_{}.py", sequence),
            executed_at: Utc::now(),
            duration_secs: 0.25,
            verdict,
            console_text: format!("step {}\nOK\n", sequence),
        }
    }

    fn summary_from(counts: VerdictCounts, total: u32) -> RunSummary {
        RunSummary {
            total,
            executed: counts.executed(),
            counts,
            elapsed_secs: 1.5,
            stopped: false,
            aborted: false,
        }
    }

    #[test]
    fn test_closed_counts_match_stored_scripts() {
        let (_dir, store) = store();
        let run_id = store.open_run("bench", 5, "{}").unwrap();

        let verdicts = [
            Verdict::Pass,
            Verdict::Fail,
            Verdict::Pass,
            Verdict::Pending,
            Verdict::Error("exit code 127".into()),
        ];
        let mut counts = VerdictCounts::default();
        for (i, v) in verdicts.iter().enumerate() {
            store
                .append_script_result(&result(run_id, i as u32 + 1, v.clone()))
                .unwrap();
            counts.record(v);
        }
        store.close_run(run_id, &summary_from(counts, 5)).unwrap();

        let run = store.get_run(run_id).unwrap().unwrap();
        assert!(run.is_closed());
        assert_eq!(run.executed, 5);
        assert_eq!(run.counts, store.verdict_counts_for_run(run_id).unwrap());
        assert_eq!(run.counts.pass, 2);
        assert_eq!(run.counts.error, 1);

        let stats: serde_json::Value =
            serde_json::from_str(run.stats_snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(stats["pass_rate"], 0.4);
    }

    #[test]
    fn test_scripts_ordered_by_sequence() {
        let (_dir, store) = store();
        let run_id = store.open_run("order", 3, "{}").unwrap();
        for seq in [1, 2, 3] {
            store
                .append_script_result(&result(run_id, seq, Verdict::Pass))
                .unwrap();
        }

        let scripts = store.fetch_scripts_for_run(run_id).unwrap();
        let seqs: Vec<u32> = scripts.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(scripts[1].file_name, "step_2.py");

        let text = store.fetch_console_text(scripts[2].id).unwrap().unwrap();
        assert_eq!(text, "step 3\nOK\n");
        assert!(store.fetch_console_text(9999).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let (_dir, store) = store();
        let run_id = store.open_run("dup", 2, "{}").unwrap();
        store
            .append_script_result(&result(run_id, 1, Verdict::Pass))
            .unwrap();
        assert!(store
            .append_script_result(&result(run_id, 1, Verdict::Fail))
            .is_err());
    }

    #[test]
    fn test_error_reason_survives_storage() {
        let (_dir, store) = store();
        let run_id = store.open_run("err", 1, "{}").unwrap();
        store
            .append_script_result(&result(
                run_id,
                1,
                Verdict::Error("failed to launch /x.py".into()),
            ))
            .unwrap();
        let scripts = store.fetch_scripts_for_run(run_id).unwrap();
        assert_eq!(
            scripts[0].verdict,
            Verdict::Error("failed to launch /x.py".into())
        );
    }

    #[test]
    fn test_query_by_label_and_range() {
        let (_dir, store) = store();
        let a = store.open_run("ecu-smoke", 1, "{}").unwrap();
        let b = store.open_run("psu-soak", 1, "{}").unwrap();
        let c = store.open_run("ecu-full", 1, "{}").unwrap();

        let ecu = store
            .query_runs(&RunQuery {
                label: Some("ecu".into()),
                ..RunQuery::default()
            })
            .unwrap();
        let ids: Vec<i64> = ecu.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&c));
        assert!(!ids.contains(&b));

        let now = Utc::now();
        let window = store
            .query_runs(&RunQuery {
                since: Some(now - Duration::hours(1)),
                until: Some(now + Duration::hours(1)),
                ..RunQuery::default()
            })
            .unwrap();
        assert_eq!(window.len(), 3);

        let future = store
            .query_runs(&RunQuery {
                since: Some(now + Duration::hours(1)),
                ..RunQuery::default()
            })
            .unwrap();
        assert!(future.is_empty());

        assert_eq!(store.list_recent_runs(2).unwrap().len(), 2);
    }

    #[test]
    fn test_open_run_has_no_end_time() {
        let (_dir, store) = store();
        let id = store.open_run("open", 4, "{\"k\":1}").unwrap();
        let run = store.get_run(id).unwrap().unwrap();
        assert!(run.end_time.is_none());
        assert_eq!(run.total, 4);
        assert_eq!(run.config_snapshot, "{\"k\":1}");
    }

    #[test]
    fn test_delete_run_cascades() {
        let (_dir, store) = store();
        let id = store.open_run("gone", 1, "{}").unwrap();
        let script_id = store
            .append_script_result(&result(id, 1, Verdict::Pass))
            .unwrap();
        assert!(store.delete_run(id).unwrap());
        assert!(store.get_run(id).unwrap().is_none());
        assert!(store.fetch_console_text(script_id).unwrap().is_none());
        assert!(!store.delete_run(id).unwrap());
    }

    #[test]
    fn test_close_orphaned_runs() {
        let (_dir, store) = store();
        let crashed = store.clone().with_owner_pid(GONE_PID);
        let id = crashed.open_run("crashed", 3, "{}").unwrap();
        store
            .append_script_result(&result(id, 1, Verdict::Pass))
            .unwrap();
        store
            .append_script_result(&result(id, 2, Verdict::Fail))
            .unwrap();

        assert_eq!(store.close_orphaned_runs().unwrap(), 1);
        let run = store.get_run(id).unwrap().unwrap();
        assert!(run.is_closed());
        assert_eq!(run.executed, 2);
        assert_eq!(run.counts.fail, 1);
        assert_eq!(store.close_orphaned_runs().unwrap(), 0);
    }

    #[test]
    fn test_run_of_live_process_not_treated_as_orphan() {
        let (_dir, store) = store();
        let live = store.open_run("in progress", 2, "{}").unwrap();
        let dead = store
            .clone()
            .with_owner_pid(GONE_PID)
            .open_run("crashed", 2, "{}")
            .unwrap();

        assert_eq!(store.close_orphaned_runs().unwrap(), 1);
        assert!(!store.get_run(live).unwrap().unwrap().is_closed());
        assert!(store.get_run(dead).unwrap().unwrap().is_closed());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_of_other_live_process_not_treated_as_orphan() {
        let (_dir, store) = store();
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let id = store
            .clone()
            .with_owner_pid(child.id())
            .open_run("other process", 1, "{}")
            .unwrap();

        assert_eq!(store.close_orphaned_runs().unwrap(), 0);
        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(store.close_orphaned_runs().unwrap(), 1);
        assert!(store.get_run(id).unwrap().unwrap().is_closed());
    }
}
