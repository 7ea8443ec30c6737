//! Integration tests for automatic restarts and concurrency.
//!
//! These tests cover:
//! - Restart attempts capped by the policy, spaced by the retry delay
//! - A single max-attempts notification per exhausted run
//! - Concurrent start requests
//! - Escalation to SIGKILL when the worker ignores SIGTERM

#![cfg(unix)]

use std::time::{Duration, Instant};
use tempfile::TempDir;

use warden_core::WardenError;
use warden_core::types::WorkerStatus;
use warden_worker::{
    LaunchSpec, LifecycleEvent, RestartPolicy, Supervisor, SupervisorConfig, SupervisorEvent,
};

fn worker(dir: &TempDir, body: &str) -> LaunchSpec {
    let path = dir.path().join("worker.sh");
    std::fs::write(&path, body).unwrap();
    LaunchSpec::new(path).with_interpreter("sh")
}

fn config(spec: LaunchSpec, policy: RestartPolicy) -> SupervisorConfig {
    SupervisorConfig::new(spec)
        .with_policy(policy.with_health_check_interval(Duration::from_millis(100)))
        .with_startup_grace(Duration::from_millis(200))
        .with_shutdown_grace(Duration::from_secs(2))
}

// ============================================================
// Auto-Restart Tests
// ============================================================

#[tokio::test]
async fn test_crash_loop_exhausts_attempts() {
    let dir = TempDir::new().unwrap();
    let retry_delay = Duration::from_millis(50);
    let policy = RestartPolicy::default()
        .with_max_attempts(3)
        .with_retry_delay(retry_delay);
    let sup = Supervisor::new(config(worker(&dir, "echo boom >&2\nexit 1\n"), policy));
    let mut sub = sup.subscribe();

    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, WardenError::StartupFailed { .. }));

    let mut scheduled = 0;
    let mut starts = Vec::new();
    let collect = async {
        while let Some(event) = sub.next_event().await {
            match event {
                SupervisorEvent::Status { state, .. } => {
                    assert!(state.is_consistent(), "invariant broken: {state:?}");
                    if state.status == WorkerStatus::Starting {
                        starts.push(state.last_update);
                    }
                }
                SupervisorEvent::Lifecycle(LifecycleEvent::RestartScheduled { attempt, .. }) => {
                    scheduled += 1;
                    assert_eq!(attempt, scheduled);
                }
                SupervisorEvent::Lifecycle(LifecycleEvent::MaxRestartAttemptsReached {
                    attempts,
                }) => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("never reached max restart attempts");

    assert_eq!(scheduled, 3);
    // One manual start plus three automatic ones
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        let gap = (pair[1] - pair[0]).to_std().unwrap();
        assert!(gap >= retry_delay, "restarts only {gap:?} apart");
    }

    // Nothing else happens afterwards
    tokio::time::sleep(Duration::from_millis(400)).await;
    while let Some(delivery) = sub.try_recv() {
        if let warden_worker::Delivery::Event(event) = delivery {
            assert!(
                !matches!(
                    event,
                    SupervisorEvent::Lifecycle(
                        LifecycleEvent::RestartScheduled { .. }
                            | LifecycleEvent::MaxRestartAttemptsReached { .. }
                    )
                ),
                "unexpected event after exhaustion: {event:?}"
            );
        }
    }

    let state = sup.snapshot();
    assert_eq!(state.status, WorkerStatus::Error);
    assert_eq!(state.restart_attempts, 3);
    assert!(state.last_error.is_some());
    assert!(sup.recent_logs(100).iter().any(|l| l.text == "boom"));
}

#[tokio::test]
async fn test_manual_start_resets_attempts() {
    let dir = TempDir::new().unwrap();
    let policy = RestartPolicy::default()
        .with_max_attempts(1)
        .with_retry_delay(Duration::from_millis(50));
    let sup = Supervisor::new(config(worker(&dir, "exit 2\n"), policy));
    let mut sub = sup.subscribe();

    let _ = sup.start().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.next_event().await {
            if matches!(
                event,
                SupervisorEvent::Lifecycle(LifecycleEvent::MaxRestartAttemptsReached { .. })
            ) {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(sup.snapshot().restart_attempts, 1);

    // Stopping from error clears the counter
    let state = sup.stop().await.unwrap();
    assert_eq!(state.status, WorkerStatus::Error);
    assert_eq!(state.restart_attempts, 0);
}

#[tokio::test]
async fn test_recovers_after_transient_crash() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("crashed-once");
    let body = format!(
        "if [ -f '{m}' ]; then echo recovered; exec sleep 30; fi\ntouch '{m}'\nsleep 0.3\nexit 1\n",
        m = marker.display()
    );
    let policy = RestartPolicy::default().with_retry_delay(Duration::from_millis(50));
    let sup = Supervisor::new(config(worker(&dir, &body), policy));
    let mut sub = sup.subscribe();

    sup.start().await.unwrap();

    let restarted = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.next_event().await {
            if let SupervisorEvent::Lifecycle(LifecycleEvent::Restarted { attempt }) = event {
                return attempt;
            }
        }
        0
    })
    .await
    .expect("worker was never restarted");

    assert_eq!(restarted, 1);
    let state = sup.snapshot();
    assert_eq!(state.status, WorkerStatus::Running);
    assert!(state.last_error.is_none());
    assert!(state.is_consistent());

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_attempts_reset_after_stable_run() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("crashed-once");
    let body = format!(
        "if [ -f '{m}' ]; then exec sleep 30; fi\ntouch '{m}'\nsleep 0.3\nexit 1\n",
        m = marker.display()
    );
    let policy = RestartPolicy::default()
        .with_retry_delay(Duration::from_millis(50))
        .with_stable_after(Duration::from_millis(300));
    let sup = Supervisor::new(config(worker(&dir, &body), policy));
    let mut sub = sup.subscribe();

    sup.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.next_event().await {
            if matches!(
                event,
                SupervisorEvent::Lifecycle(LifecycleEvent::Restarted { .. })
            ) {
                break;
            }
        }
    })
    .await
    .expect("worker was never restarted");
    assert_eq!(sup.snapshot().restart_attempts, 1);

    let mut rx = sup.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| s.restart_attempts == 0))
        .await
        .expect("attempts never reset")
        .unwrap()
        .clone();
    assert_eq!(state.status, WorkerStatus::Running);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_pending_restart() {
    let dir = TempDir::new().unwrap();
    let policy = RestartPolicy::default().with_retry_delay(Duration::from_millis(500));
    let sup = Supervisor::new(config(worker(&dir, "exit 1\n"), policy));
    let mut sub = sup.subscribe();

    let _ = sup.start().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.next_event().await {
            if matches!(
                event,
                SupervisorEvent::Lifecycle(LifecycleEvent::RestartScheduled { .. })
            ) {
                break;
            }
        }
    })
    .await
    .expect("no restart scheduled");

    let state = sup.stop().await.unwrap();
    assert_eq!(state.status, WorkerStatus::Error);
    assert_eq!(state.restart_attempts, 0);

    // Well past the retry delay
    tokio::time::sleep(Duration::from_millis(900)).await;
    while let Some(delivery) = sub.try_recv() {
        if let warden_worker::Delivery::Event(SupervisorEvent::Status { state, .. }) = delivery {
            assert_ne!(state.status, WorkerStatus::Starting, "cancelled restart still ran");
        }
    }
    let state = sup.snapshot();
    assert_eq!(state.status, WorkerStatus::Error);
    assert_eq!(state.restart_attempts, 0);
    assert!(state.process_id.is_none());
}

#[tokio::test]
async fn test_failed_relaunch_retried_on_health_tick() {
    let dir = TempDir::new().unwrap();
    let spec = worker(&dir, "exit 1\n");
    let script = spec.script.clone();
    let policy = RestartPolicy::default()
        .with_max_attempts(3)
        .with_retry_delay(Duration::from_millis(200));
    let sup = Supervisor::new(config(spec, policy));
    let mut sub = sup.subscribe();

    let _ = sup.start().await;

    let mut scheduled = 0;
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = sub.next_event().await {
            match event {
                SupervisorEvent::Lifecycle(LifecycleEvent::RestartScheduled { attempt, .. }) => {
                    scheduled += 1;
                    assert_eq!(attempt, scheduled);
                    if attempt == 1 {
                        // Every later launch fails before a process exists
                        std::fs::remove_file(&script).unwrap();
                    }
                }
                SupervisorEvent::Lifecycle(LifecycleEvent::MaxRestartAttemptsReached {
                    attempts,
                }) => return attempts,
                _ => {}
            }
        }
        0
    })
    .await
    .expect("owed restarts were never retried");

    assert_eq!(reached, 3);
    assert_eq!(scheduled, 3);
    let state = sup.snapshot();
    assert_eq!(state.status, WorkerStatus::Error);
    assert!(
        state.last_error.unwrap_or_default().contains("not found"),
        "last error should name the missing script"
    );
}

// ============================================================
// Concurrency Tests
// ============================================================

#[tokio::test]
async fn test_concurrent_starts_only_one_wins() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(config(
        worker(&dir, "exec sleep 30\n"),
        RestartPolicy::default(),
    ));

    let (a, b) = tokio::join!(sup.start(), sup.start());
    let (ok, err) = match (a, b) {
        (Ok(state), Err(err)) | (Err(err), Ok(state)) => (state, err),
        other => panic!("expected exactly one success, got {other:?}"),
    };

    assert_eq!(ok.status, WorkerStatus::Running);
    assert!(matches!(
        err,
        WardenError::AlreadyStarting | WardenError::AlreadyRunning
    ));

    sup.stop().await.unwrap();
    assert!(sup.snapshot().is_consistent());
}

#[tokio::test]
async fn test_stop_escalates_when_sigterm_ignored() {
    let dir = TempDir::new().unwrap();
    let sup = Supervisor::new(
        config(
            worker(&dir, "trap '' TERM\nwhile true; do sleep 0.1; done\n"),
            RestartPolicy::default(),
        )
        .with_shutdown_grace(Duration::from_millis(300)),
    );

    sup.start().await.unwrap();
    let started = Instant::now();
    let state = sup.stop().await.unwrap();

    assert_eq!(state.status, WorkerStatus::Stopped);
    assert_eq!(state.last_exit.and_then(|e| e.signal), Some(9));
    assert!(started.elapsed() >= Duration::from_millis(300));
}
