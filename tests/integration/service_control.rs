//! End-to-end lifecycle tests that spawn real processes.

mod common;

use std::time::{Duration, Instant};

use common::{project_with, read_log, stop_all, wait_for};
use pmon::daemon::{NoEscape, StopOptions, process_alive, process_tree};

#[test]
fn short_lived_service_logs_banner_and_output() {
    let (_dir, manager) = project_with("echo-svc: \"echo hello\"\n");

    assert!(manager.start_service("echo-svc", false).unwrap());

    assert!(wait_for(Duration::from_secs(5), || {
        read_log(&manager, "echo-svc-out.log").contains("hello")
    }));
    assert!(
        read_log(&manager, "echo-svc-out.log")
            .contains("--- Starting service 'echo-svc' at")
    );

    // The process exits on its own and the next query heals the record.
    assert!(wait_for(Duration::from_secs(5), || {
        !manager.is_running("echo-svc")
    }));
    assert_eq!(manager.registry().read_pid("echo-svc"), None);
}

#[test]
fn sleeper_starts_and_stops_within_budget() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());
    assert!(manager.is_running("sleeper"));
    let pid = manager.get_service_pid("sleeper").expect("recorded pid");
    assert!(process_alive(pid));

    let begun = Instant::now();
    assert!(manager.stop_service("sleeper").unwrap());
    // sleep dies to SIGTERM, so the stop must finish inside the graceful
    // window plus slack, never near the SIGKILL budget.
    assert!(begun.elapsed() < Duration::from_secs(8));

    assert!(!manager.is_running("sleeper"));
    assert!(wait_for(Duration::from_secs(3), || !process_alive(pid)));
    assert_eq!(manager.registry().read_pid("sleeper"), None);
    assert_eq!(manager.registry().read_start_time("sleeper"), None);
}

#[test]
fn start_is_idempotent_while_running() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());
    let first = manager.get_service_pid("sleeper").unwrap();

    assert!(manager.start_service("sleeper", false).unwrap());
    assert_eq!(manager.get_service_pid("sleeper"), Some(first));

    stop_all(&manager);
}

#[test]
fn stop_takes_down_the_whole_tree() {
    let (_dir, manager) = project_with("piped: \"sleep 30 | sleep 31\"\n");

    assert!(manager.start_service("piped", false).unwrap());
    let pid = manager.get_service_pid("piped").unwrap();

    // Both sides of the pipe are children of the spawned shell.
    assert!(wait_for(Duration::from_secs(5), || {
        process_tree(pid).len() >= 3
    }));
    let tree = process_tree(pid);

    assert!(manager.stop_service("piped").unwrap());
    assert!(wait_for(Duration::from_secs(3), || {
        tree.iter().all(|&member| !process_alive(member))
    }));
}

#[test]
fn restart_replaces_the_process_and_counts() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());
    let first = manager.get_service_pid("sleeper").unwrap();
    assert_eq!(manager.get_restarts_count("sleeper"), 0);

    assert!(manager.restart_service("sleeper").unwrap());
    let second = manager.get_service_pid("sleeper").unwrap();

    assert_ne!(first, second);
    assert_eq!(manager.get_restarts_count("sleeper"), 1);

    stop_all(&manager);
}

#[test]
fn restart_of_stopped_service_just_starts_it() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.restart_service("sleeper").unwrap());
    assert!(manager.is_running("sleeper"));
    assert_eq!(manager.get_restarts_count("sleeper"), 1);

    stop_all(&manager);
}

#[test]
fn missing_binary_fails_inside_the_shell() {
    let (_dir, manager) = project_with("broken: \"no-such-binary-xyz --flag\"\n");

    // The shell itself spawns fine; the failure lands in the error log and
    // the service simply never stays up.
    assert!(manager.start_service("broken", false).unwrap());
    assert!(wait_for(Duration::from_secs(5), || {
        !manager.is_running("broken")
    }));
    assert!(read_log(&manager, "broken-error.log").contains("not found"));
}

#[test]
fn term_ignoring_service_is_killed_by_escalation() {
    let (_dir, manager) = project_with(
        "stubborn: \"trap '' TERM; while :; do sleep 1; done\"\n",
    );

    assert!(manager.start_service("stubborn", false).unwrap());
    let pid = manager.get_service_pid("stubborn").unwrap();

    let begun = Instant::now();
    let options = StopOptions {
        graceful_timeout: Duration::from_secs(1),
        forceful_timeout: Duration::from_secs(10),
    };
    assert!(manager
        .stop_service_with("stubborn", options, &NoEscape)
        .unwrap());
    // SIGTERM is ignored, so only the SIGKILL phase can end this; the whole
    // call still has to land inside the combined budgets.
    assert!(begun.elapsed() < Duration::from_secs(12));

    assert!(wait_for(Duration::from_secs(3), || !process_alive(pid)));
    assert!(!manager.is_running("stubborn"));
    assert_eq!(manager.registry().read_pid("stubborn"), None);
}

#[test]
fn stop_with_tight_budget_still_cleans_registry() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());
    let options = StopOptions {
        graceful_timeout: Duration::from_secs(1),
        forceful_timeout: Duration::from_secs(5),
    };
    assert!(manager
        .stop_service_with("sleeper", options, &NoEscape)
        .unwrap());
    assert_eq!(manager.registry().read_pid("sleeper"), None);
}
