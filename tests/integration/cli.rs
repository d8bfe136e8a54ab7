//! Black-box tests of the `pmon` binary.

mod common;

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn project(yaml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pmon.yml"), yaml).unwrap();
    dir
}

fn pmon(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pmon").unwrap();
    cmd.current_dir(dir.path());
    cmd
}

#[test]
fn dry_run_prints_resolved_commands_without_spawning() {
    let dir = project(
        r#"
api:
  cmd: "python serve.py --port ${API_PORT:-8000}"
  cwd: "app"
  env:
    MODE: "prod"
"#,
    );

    pmon(&dir)
        .args(["start", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "cd app && MODE=prod python serve.py --port 8000",
        ));

    // Nothing was recorded.
    let host_dirs: Vec<_> = fs::read_dir(dir.path().join(".pmon"))
        .unwrap()
        .flatten()
        .collect();
    for host in host_dirs {
        let pids = host.path().join("pids");
        assert_eq!(fs::read_dir(pids).unwrap().count(), 0);
    }
}

#[test]
fn ls_table_lists_configured_services() {
    let dir = project("api: \"sleep 30\"\nworker: \"sleep 30\"\n");

    pmon(&dir)
        .arg("ls")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("api")
                .and(predicate::str::contains("worker"))
                .and(predicate::str::contains("stopped"))
                .and(predicate::str::contains("restarts")),
        );
}

#[test]
fn ls_json_is_machine_readable() {
    let dir = project("api: \"sleep 30\"\n");

    let output = pmon(&dir).args(["ls", "--json"]).output().unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["name"], "api");
    assert_eq!(rows[0]["status"], "stopped");
    assert_eq!(rows[0]["restarts"], 0);
}

#[test]
fn unknown_service_fails_with_an_error() {
    let dir = project("api: \"sleep 30\"\n");

    pmon(&dir)
        .args(["start", "mystery"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mystery"));
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().unwrap();

    pmon(&dir).arg("ls").assert().failure();
}

#[test]
fn numeric_ids_select_by_declaration_order() {
    let dir = project("first: \"echo one\"\nsecond: \"echo two\"\n");

    pmon(&dir)
        .args(["start", "--dry-run", "1"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("echo two")
                .and(predicate::str::contains("echo one").not()),
        );
}

#[test]
fn all_keyword_selects_every_service() {
    let dir = project("first: \"echo one\"\nsecond: \"echo two\"\n");

    pmon(&dir)
        .args(["start", "--dry-run", "all"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("echo one").and(predicate::str::contains("echo two")),
        );

    // Nothing is configured under the name itself; the keyword still works.
    pmon(&dir).args(["stop", "all"]).assert().success();
    pmon(&dir).args(["flush", "all"]).assert().success();
}

#[test]
fn stop_of_idle_project_succeeds() {
    let dir = project("api: \"sleep 30\"\n");

    pmon(&dir).arg("stop").assert().success();
}

#[test]
fn full_cycle_through_the_binary() {
    let dir = project("svc: \"sleep 30\"\n");

    pmon(&dir).args(["start", "svc"]).assert().success();
    pmon(&dir)
        .args(["ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("online"));
    pmon(&dir).args(["stop", "svc"]).assert().success();
    pmon(&dir)
        .args(["ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));
}
