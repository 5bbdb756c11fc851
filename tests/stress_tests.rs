//! Stress tests for shellout configuration and spawn failure paths

use std::sync::Mutex;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use shellout::{Error, OptionValue, ShellOut};

static STRESS_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Repeated lookup failures must each surface as not-found and leave zero
/// reapable children behind.
#[test]
fn stress_spawn_failures_leave_no_zombies() {
    let _lock = STRESS_TEST_LOCK.lock();

    let mut failures = 0;
    for _ in 0..100 {
        let mut cmd = ShellOut::new(vec!["/bin/this-is-not-a-real-command"]);
        match cmd.run_command() {
            Err(Error::CommandNotFound(_)) => failures += 1,
            other => panic!("expected CommandNotFound, got {other:?}"),
        }
    }
    assert_eq!(failures, 100);

    // Nothing should be waiting to be reaped. Concurrent tests in this
    // binary are serialized by the lock, so any child here would be ours.
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => reaped += 1,
            Err(_) => break, // ECHILD: no children at all
        }
    }
    assert_eq!(reaped, 0);
}

/// Rapid construction with the full option surface.
#[test]
fn stress_rapid_config_creation() {
    let _lock = STRESS_TEST_LOCK.lock();

    for i in 0..50 {
        let _cmd = ShellOut::with_options(
            format!("echo {i}"),
            vec![
                ("cwd", OptionValue::Str("/tmp".to_string())),
                ("timeout", OptionValue::Int(5)),
                ("returns", OptionValue::Codes(vec![0, 1])),
            ],
        )
        .expect("valid options must be accepted");
    }
}

/// Unknown keys are rejected every time, naming the key.
#[test]
fn stress_option_validation() {
    let _lock = STRESS_TEST_LOCK.lock();

    let bogus = ["frab", "jobs", "cwdd", "Timeout", "liveStream", ""];
    for key in bogus {
        let err = ShellOut::with_options("true", vec![(key, OptionValue::Int(1))])
            .err()
            .expect("unknown option must be rejected");
        assert!(matches!(err, Error::InvalidCommandOption(_)));
        assert!(err.to_string().contains(&format!("'{key}'")));
    }
}

/// Umask normalization across representative inputs.
#[test]
fn stress_umask_values() {
    let _lock = STRESS_TEST_LOCK.lock();

    let cases: [(u32, u32); 4] = [(0o7555, 0o7555), (2925, 0o5555), (0, 0), (0o22, 0o22)];
    for (input, expected) in cases {
        let mut cmd = ShellOut::new("true");
        cmd.set_umask(input).unwrap();
        assert_eq!(cmd.umask(), Some(expected), "umask {input}");
    }

    let strings = [("7777", 0o7777), ("2222", 0o2222), ("022", 0o22)];
    for (input, expected) in strings {
        let mut cmd = ShellOut::new("true");
        cmd.set_umask(input).unwrap();
        assert_eq!(cmd.umask(), Some(expected), "umask {input:?}");
    }
}

/// Timeout configuration across a spread of durations.
#[test]
fn stress_timeout_configurations() {
    let _lock = STRESS_TEST_LOCK.lock();

    let timeouts = [
        Duration::from_millis(100),
        Duration::from_secs(1),
        Duration::from_secs(60),
        Duration::from_secs(600),
    ];
    for timeout in timeouts {
        let mut cmd = ShellOut::new("true");
        cmd.set_timeout(timeout);
        assert_eq!(cmd.timeout(), timeout);
    }
}

/// Back-to-back sequential runs of one configuration.
#[test]
fn stress_sequential_runs() {
    let _lock = STRESS_TEST_LOCK.lock();

    let mut cmd = ShellOut::new("echo ok");
    for _ in 0..10 {
        let result = cmd.run_command().unwrap();
        assert_eq!(result.stdout_lossy(), "ok\n");
        assert!(result.check_error().is_ok());
    }
}
