//! Smoke tests -- verify the binary runs and its subcommands are wired up.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

/// Config pointing the history database into `dir`. Scripts go through
/// `/bin/sh` so a freshly written file is never exec'd directly.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("scriptseq.toml");
    let db = dir.join("history.db");
    std::fs::write(
        &path,
        format!(
            "[runner]\ninterpreter = \"/bin/sh\"\n\n[storage]\ndb_path = {:?}\n\n[logging]\nlevel = \"warn\"\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path
}

fn scriptseq(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("scriptseq").unwrap();
    cmd.env_remove("SCRIPTSEQ_CONFIG").arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("scriptseq")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sequential test-script orchestrator"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("scriptseq")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("scriptseq"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["run", "--help"][..],
        &["history", "runs", "--help"],
        &["history", "scripts", "--help"],
        &["history", "console", "--help"],
        &["history", "delete", "--help"],
        &["config", "show", "--help"],
    ] {
        Command::cargo_bin("scriptseq")
            .unwrap()
            .args(args)
            .assert()
            .success();
    }
}

#[test]
fn test_config_show_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    scriptseq(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pass_token = \"OK\""))
        .stdout(predicate::str::contains("history.db"));
}

#[test]
fn test_config_from_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    Command::cargo_bin("scriptseq")
        .unwrap()
        .env("SCRIPTSEQ_CONFIG", &config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("history.db"))
        .stdout(predicate::str::contains("/bin/sh"));
}

#[test]
fn test_missing_config_file_is_an_error() {
    Command::cargo_bin("scriptseq")
        .unwrap()
        .args(["--config", "/nonexistent/scriptseq.toml", "config", "show"])
        .assert()
        .failure();
}

#[test]
fn test_empty_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    scriptseq(&config)
        .args(["history", "runs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs found."));
}

#[test]
fn test_delete_unknown_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    scriptseq(&config)
        .args(["history", "delete", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run 42 not found"));
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_run_then_browse_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let ok = script(dir.path(), "ok.sh", "echo 'voltage in range'\necho OK");

        scriptseq(&config)
            .args(["run", "--label", "smoke"])
            .arg(&ok)
            .assert()
            .success()
            .stdout(predicate::str::contains("PASS"))
            .stdout(predicate::str::contains("voltage in range"));

        scriptseq(&config)
            .args(["history", "runs", "--label", "smo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("smoke"))
            .stdout(predicate::str::contains("1/1"));

        scriptseq(&config)
            .args(["history", "scripts", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ok.sh"));

        scriptseq(&config)
            .args(["history", "console", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("voltage in range"));

        scriptseq(&config)
            .args(["history", "delete", "1"])
            .assert()
            .success();

        scriptseq(&config)
            .args(["history", "runs"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs found."));
    }

    #[test]
    fn test_failing_script_sets_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let bad = script(dir.path(), "bad.sh", "echo NOT-OK");

        scriptseq(&config)
            .arg("run")
            .arg(&bad)
            .assert()
            .failure()
            .stdout(predicate::str::contains("FAIL"));
    }

    #[test]
    fn test_breakpoint_resumes_on_closed_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        let a = script(dir.path(), "a.sh", "echo OK");
        let b = script(dir.path(), "b.sh", "echo OK");

        scriptseq(&config)
            .args(["run", "--break", "1"])
            .arg(&a)
            .arg(&b)
            .assert()
            .success()
            .stdout(predicate::str::contains("Breakpoint before #1 (b.sh)"))
            .stdout(predicate::str::contains("Executed 2/2"));
    }

    #[test]
    fn test_manifest_with_json_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        script(dir.path(), "first.sh", "echo OK");
        script(dir.path(), "second.sh", "echo 'no verdict here'");
        let manifest = dir.path().join("suite.txt");
        std::fs::write(&manifest, "# power suite\n[power]\nfirst.sh\nsecond.sh\n").unwrap();

        scriptseq(&config)
            .arg("run")
            .arg("--manifest")
            .arg(&manifest)
            .arg("--json")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"type\":\"run_complete\""))
            .stdout(predicate::str::contains("\"kind\":\"pending\""));
    }
}
