//! Integration tests for the child lifecycle
//!
//! These tests verify the coordinator's state machine end to end:
//! - signal delivery racing the watcher
//! - termination waiting from one or many tasks
//! - cancellation of a waiter never eating another waiter's termination
//! - scoped termination cleanup

use std::sync::Arc;
use std::time::Duration;

use procyon::{Command, Signal, Subprocess};

fn spawn_sleep(seconds: &str) -> Subprocess {
    Command::new("/bin/sleep")
        .arg(seconds)
        .spawn()
        .expect("Failed to spawn sleep")
}

/// A concurrent task kills a long sleeper; the waiter sees the negated
/// signal number.
#[tokio::test]
async fn test_kill_from_concurrent_task() {
    let child = Arc::new(spawn_sleep("86400"));

    let killer = {
        let child = Arc::clone(&child);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let delivered = child.kill().expect("Failed to send SIGKILL");
            assert!(delivered, "child should still be running after 1s");
        })
    };

    let status = child.wait().await;
    assert_eq!(status.as_raw(), -9);
    assert_eq!(status.signal(), Some(9));
    killer.await.expect("Killer task panicked");
}

#[tokio::test]
async fn test_normal_exit_reports_zero() {
    let child = spawn_sleep("1");
    let status = child.wait().await;
    assert!(status.success());
    assert_eq!(status.as_raw(), 0);
}

#[tokio::test]
async fn test_exit_code_is_passed_through() {
    let child = Command::new("/bin/sh")
        .args(["-c", "exit 42"])
        .spawn()
        .expect("Failed to spawn sh");
    assert_eq!(child.wait().await.code(), Some(42));
}

/// Cancelling one waiter neither disturbs the child nor the surviving
/// waiter.
#[tokio::test]
async fn test_cancelled_waiter_does_not_eat_termination() {
    let child = Arc::new(spawn_sleep("2"));

    let doomed = {
        let child = Arc::clone(&child);
        tokio::spawn(async move { child.wait().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    doomed.abort();

    let join = doomed.await;
    assert!(
        join.is_err() && join.unwrap_err().is_cancelled(),
        "aborted waiter must observe cancellation"
    );

    // The main task still observes the real termination.
    let status = child.wait().await;
    assert!(status.success());
}

#[tokio::test]
async fn test_multiple_waiters_all_observe_the_status() {
    let child = Arc::new(spawn_sleep("2"));

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let child = Arc::clone(&child);
        waiters.push(tokio::spawn(async move { child.wait().await }));
    }

    for waiter in waiters {
        let status = waiter.await.expect("Waiter task panicked");
        assert!(status.success());
    }
}

#[tokio::test]
async fn test_wait_after_termination_returns_cached_status() {
    let child = spawn_sleep("1");
    let first = child.wait().await;
    let second = child.wait().await;
    assert_eq!(first, second);
    assert_eq!(child.exit_status(), Some(first));
    assert!(!child.is_running());
}

/// The child is gone by the time the scoped body's result is returned.
#[tokio::test]
async fn test_terminate_after_reaps_the_child() {
    let child = spawn_sleep("86400");

    let result = child
        .terminate_after(Signal::SIGTERM, async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "body result"
        })
        .await;

    assert_eq!(result, "body result");
    let status = child.wait().await;
    assert_eq!(status.as_raw(), -15);
}

#[tokio::test]
async fn test_send_signal_after_termination_is_a_noop() {
    let child = Command::new("/bin/true").spawn().expect("Failed to spawn true");
    assert!(child.wait().await.success());

    let delivered = child
        .send_signal(Signal::SIGTERM)
        .expect("Signal to a terminated child must not error");
    assert!(!delivered);
}

#[tokio::test]
async fn test_stop_and_continue_do_not_terminate() {
    let child = spawn_sleep("2");

    assert!(child.send_signal(Signal::SIGSTOP).expect("Failed to SIGSTOP"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(child.is_running(), "a stopped child is not terminated");

    assert!(child.send_signal(Signal::SIGCONT).expect("Failed to SIGCONT"));
    let status = child.wait().await;
    assert!(status.success());
}
