//! Log engine behavior exercised through real service runs.

mod common;

use std::time::Duration;

use common::{log_dir_entries, project_with, read_log, stop_all, wait_for};
use pmon::logs::read_last_lines;

#[test]
fn merged_mode_interleaves_both_streams_in_one_file() {
    let (_dir, manager) = project_with(
        r#"
mix:
  cmd: "echo to-stdout; echo to-stderr 1>&2"
  merge_logs: true
"#,
    );

    assert!(manager.start_service("mix", false).unwrap());
    assert!(wait_for(Duration::from_secs(5), || {
        let merged = read_log(&manager, "mix.log");
        merged.contains("to-stdout") && merged.contains("to-stderr")
    }));

    let entries = log_dir_entries(&manager);
    assert!(entries.contains(&"mix.log".to_string()));
    assert!(!entries.contains(&"mix-out.log".to_string()));
    assert!(!entries.contains(&"mix-error.log".to_string()));
}

#[test]
fn split_mode_keeps_streams_apart() {
    let (_dir, manager) =
        project_with("split: \"echo to-stdout; echo to-stderr 1>&2\"\n");

    assert!(manager.start_service("split", false).unwrap());
    assert!(wait_for(Duration::from_secs(5), || {
        read_log(&manager, "split-out.log").contains("to-stdout")
            && read_log(&manager, "split-error.log").contains("to-stderr")
    }));
    assert!(!read_log(&manager, "split-out.log").contains("to-stderr"));
}

#[test]
fn each_start_rotates_the_previous_run() {
    let (_dir, manager) = project_with("echo-svc: \"echo run\"\n");

    for _ in 0..3 {
        assert!(manager.start_service("echo-svc", false).unwrap());
        assert!(wait_for(Duration::from_secs(5), || {
            !manager.is_running("echo-svc")
        }));
    }

    let entries = log_dir_entries(&manager);
    assert!(entries.contains(&"echo-svc-out.log".to_string()));
    assert!(entries.contains(&"echo-svc-out.log.1".to_string()));
    assert!(entries.contains(&"echo-svc-out.log.2".to_string()));
    assert!(read_log(&manager, "echo-svc-out.log.2").contains("run"));
}

#[test]
fn flush_deletes_stopped_and_clears_running() {
    let (_dir, manager) = project_with(
        "done: \"echo finished\"\nsleeper: \"sleep 30\"\n",
    );

    assert!(manager.start_service("done", false).unwrap());
    assert!(wait_for(Duration::from_secs(5), || !manager.is_running("done")));
    assert!(manager.start_service("sleeper", false).unwrap());

    let running = manager.running_services();
    let summary = manager
        .logs()
        .flush_logs(&["done".to_string(), "sleeper".to_string()], &running);

    // The stopped service's files are gone entirely.
    let entries = log_dir_entries(&manager);
    assert!(!entries.iter().any(|name| name.starts_with("done-")));
    assert_eq!(summary.per_service["done"].0, 2);

    // The running service keeps its current files, truncated to a banner.
    let out = read_log(&manager, "sleeper-out.log");
    assert!(out.starts_with("--- Logs flushed at"));
    assert!(!out.contains("Starting service"));
    assert_eq!(summary.per_service["sleeper"].1, 2);

    stop_all(&manager);
}

#[test]
fn recent_lines_come_back_in_order() {
    let (_dir, manager) =
        project_with("counter: \"for i in 1 2 3 4 5; do echo line-$i; done\"\n");

    assert!(manager.start_service("counter", false).unwrap());
    assert!(wait_for(Duration::from_secs(5), || {
        read_log(&manager, "counter-out.log").contains("line-5")
    }));

    let path = manager.paths().log_dir.join("counter-out.log");
    let recent = read_last_lines(&path, 3).unwrap();
    assert_eq!(recent, vec!["line-3", "line-4", "line-5"]);
}
