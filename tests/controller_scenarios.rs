//! End-to-end controller scenarios against real shell scripts.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use scriptseq::classifier::Verdict;
use scriptseq::config::AppConfig;
use scriptseq::controller::{Controller, ExecutionState, RunRequest, ScriptQueue};
use scriptseq::events::{EventReceiver, RunEvent};
use scriptseq::storage::HistoryStore;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn setup(dir: &Path) -> (AppConfig, Controller, HistoryStore) {
    let mut config = AppConfig::default();
    config.storage.db_path = dir.join("history.db");
    config.runner.interpreter = Some("/bin/sh".into());
    config.runner.terminate_grace_ms = 300;
    let store = scriptseq::open_history(&config.storage).unwrap();
    let ctl = Controller::from_config(&config, Some(store.clone())).unwrap();
    (config, ctl, store)
}

fn request(config: &AppConfig, paths: Vec<PathBuf>) -> RunRequest {
    RunRequest {
        label: "scenario".into(),
        queue: ScriptQueue::from_paths(paths),
        config_snapshot: config.snapshot(),
    }
}

async fn next_matching(rx: &mut EventReceiver, pred: impl Fn(&RunEvent) -> bool) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ev = rx.recv().await.expect("event channel closed");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_verdicts_persisted_for_mixed_suite() {
    let dir = tempfile::tempdir().unwrap();
    let (config, ctl, store) = setup(dir.path());
    let scripts = vec![
        script(dir.path(), "pass.sh", "echo 'step 1'\necho OK"),
        script(dir.path(), "fail.sh", "echo OK\necho 'NOT-OK: 12V rail low'"),
        script(dir.path(), "silent.sh", "echo 'calibrating'"),
        script(dir.path(), "crash.sh", "exit 3"),
        script(dir.path(), "noisy.sh", "echo 'DEBUG: NOT-OK is a token'\necho OK >&2"),
    ];
    let mut rx = ctl.subscribe();
    ctl.start(request(&config, scripts)).unwrap();

    let run_id = match next_matching(&mut rx, |e| matches!(e, RunEvent::RunStarted { .. })).await {
        RunEvent::RunStarted { run_id, .. } => run_id.unwrap(),
        _ => unreachable!(),
    };
    let summary = ctl.wait().await.unwrap();

    let verdicts: Vec<Verdict> = store
        .fetch_scripts_for_run(run_id)
        .unwrap()
        .into_iter()
        .map(|s| s.verdict)
        .collect();
    assert_eq!(verdicts.len(), 5);
    assert_eq!(verdicts[0], Verdict::Pass);
    assert_eq!(verdicts[1], Verdict::Fail);
    assert_eq!(verdicts[2], Verdict::Pending);
    assert!(verdicts[3].is_error());
    assert_eq!(verdicts[4], Verdict::Pass);

    assert_eq!(summary.executed, 5);
    assert_eq!(store.verdict_counts_for_run(run_id).unwrap(), summary.counts);
    let run = store.get_run(run_id).unwrap().unwrap();
    assert!(run.is_closed());
    assert!(run.config_snapshot.contains("pass_token"));
}

#[tokio::test]
async fn test_crash_after_verdict_keeps_verdict_and_reports_exit() {
    let dir = tempfile::tempdir().unwrap();
    let (config, ctl, store) = setup(dir.path());
    let scripts = vec![
        script(dir.path(), "flaky.sh", "echo 'rail check'\necho OK\nexit 2"),
        script(dir.path(), "after.sh", "echo OK"),
    ];
    let mut rx = ctl.subscribe();
    ctl.start(request(&config, scripts)).unwrap();

    let err = next_matching(&mut rx, |e| matches!(e, RunEvent::Error { .. })).await;
    match err {
        RunEvent::Error { message, fatal } => {
            assert!(message.contains("flaky.sh"));
            assert!(message.contains("exited with code 2"));
            assert!(!fatal);
        }
        _ => unreachable!(),
    }
    let summary = ctl.wait().await.unwrap();
    assert_eq!(summary.counts.pass, 2);
    assert_eq!(summary.counts.error, 0);

    let runs = store.list_recent_runs(1).unwrap();
    let scripts = store.fetch_scripts_for_run(runs[0].id).unwrap();
    assert_eq!(scripts[0].verdict, Verdict::Pass);
    let text = store.fetch_console_text(scripts[0].id).unwrap().unwrap();
    assert!(text.contains("rail check"));
}

#[tokio::test]
async fn test_stop_kills_long_script_and_its_children() {
    let dir = tempfile::tempdir().unwrap();
    let (config, ctl, store) = setup(dir.path());
    let scripts = vec![
        script(dir.path(), "quick.sh", "echo OK"),
        script(dir.path(), "hang.sh", "echo 'soaking'\nsleep 60 &\nsleep 60\necho OK"),
        script(dir.path(), "never.sh", "echo OK"),
    ];
    let mut rx = ctl.subscribe();
    ctl.start(request(&config, scripts)).unwrap();

    next_matching(&mut rx, |e| {
        matches!(e, RunEvent::ConsoleLine { sequence: 2, line } if line == "soaking")
    })
    .await;
    let asked = Instant::now();
    ctl.stop().unwrap();
    let summary = ctl.wait().await.unwrap();

    assert!(asked.elapsed() < Duration::from_secs(5));
    assert!(summary.stopped);
    assert_eq!(summary.executed, 2);
    assert_eq!(ctl.state(), ExecutionState::Completed);

    let runs = store.list_recent_runs(1).unwrap();
    let scripts = store.fetch_scripts_for_run(runs[0].id).unwrap();
    let names: Vec<&str> = scripts.iter().map(|s| s.file_name.as_str()).collect();
    assert_eq!(names, vec!["quick.sh", "hang.sh"]);
    // Output before the stop still classifies.
    assert_eq!(scripts[1].verdict, Verdict::Pending);
}

#[tokio::test]
async fn test_breakpoint_then_resume_runs_remaining() {
    let dir = tempfile::tempdir().unwrap();
    let (config, ctl, _store) = setup(dir.path());
    let marker = dir.path().join("b-ran");
    let scripts = vec![
        script(dir.path(), "a.sh", "echo OK"),
        script(
            dir.path(),
            "b.sh",
            &format!("touch {:?}\necho OK", marker.display().to_string()),
        ),
    ];
    ctl.toggle_breakpoint(1).unwrap();
    let mut rx = ctl.subscribe();
    ctl.start(request(&config, scripts)).unwrap();

    next_matching(&mut rx, |e| matches!(e, RunEvent::BreakpointHit { position: 1 })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());

    ctl.resume().unwrap();
    let summary = ctl.wait().await.unwrap();
    assert_eq!(summary.counts.pass, 2);
    assert!(marker.exists());
}

#[tokio::test]
async fn test_missing_script_is_error_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let (config, ctl, _store) = setup(dir.path());
    let scripts = vec![
        dir.path().join("does-not-exist.sh"),
        script(dir.path(), "ok.sh", "echo OK"),
    ];
    ctl.start(request(&config, scripts)).unwrap();
    let summary = ctl.wait().await.unwrap();

    assert_eq!(summary.counts.error, 1);
    assert_eq!(summary.counts.pass, 1);
    assert!(!summary.aborted);
}
