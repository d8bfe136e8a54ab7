//! Registry durability and reconciliation against real processes.

mod common;

use std::{thread, time::Duration};

use common::{project_with, stop_all, wait_for};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use pmon::runtime::{STATE_DIR_NAME, hostname};

#[test]
fn killed_process_leaves_a_stale_record_that_heals() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());
    let pid = manager.get_service_pid("sleeper").unwrap();

    // Kill behind the supervisor's back, as a crash would.
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        !manager.is_running("sleeper")
    }));
    // Reconciliation removed the record, not just the answer.
    assert_eq!(manager.registry().read_pid("sleeper"), None);
    assert_eq!(manager.registry().read_start_time("sleeper"), None);
}

#[test]
fn uptime_tracks_the_recorded_start_time() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());
    thread::sleep(Duration::from_millis(1200));

    let uptime = manager.get_uptime("sleeper").expect("running uptime");
    assert!(uptime >= 1.0 && uptime < 30.0, "uptime was {uptime}");

    stop_all(&manager);
    assert_eq!(manager.get_uptime("sleeper"), None);
}

#[test]
fn state_lives_under_a_per_host_directory() {
    let (dir, manager) = project_with("svc: \"echo hi\"\n");

    let expected_root = dir.path().join(STATE_DIR_NAME).join(hostname());
    assert_eq!(manager.paths().root, expected_root);
    assert!(manager.paths().pid_dir.is_dir());
    assert!(manager.paths().log_dir.is_dir());
    assert_eq!(manager.paths().pid_dir, expected_root.join("pids"));
    assert_eq!(manager.paths().log_dir, expected_root.join("logs"));
}

#[test]
fn restart_counter_survives_stop_and_start() {
    let (_dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.restart_service("sleeper").unwrap());
    assert!(manager.restart_service("sleeper").unwrap());
    assert_eq!(manager.get_restarts_count("sleeper"), 2);

    stop_all(&manager);
    assert_eq!(manager.get_restarts_count("sleeper"), 2);

    assert!(manager.start_service("sleeper", false).unwrap());
    assert_eq!(manager.get_restarts_count("sleeper"), 2);
    stop_all(&manager);
}

#[test]
fn two_managers_share_the_same_view() {
    let (dir, manager) = project_with("sleeper: \"sleep 30\"\n");

    assert!(manager.start_service("sleeper", false).unwrap());

    // A second invocation over the same project sees the running service.
    let config = pmon::config::load_config(&dir.path().join("pmon.yml")).unwrap();
    let other = pmon::daemon::ServiceManager::new(config).unwrap();
    assert!(other.is_running("sleeper"));
    assert_eq!(
        other.get_service_pid("sleeper"),
        manager.get_service_pid("sleeper")
    );

    assert!(other.stop_service("sleeper").unwrap());
    assert!(!manager.is_running("sleeper"));
}
