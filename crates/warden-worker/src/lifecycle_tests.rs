//! Lifecycle tests for the supervisor.
//!
//! These tests cover the worker lifecycle scenarios:
//! - Start and stop a healthy worker
//! - Stop is idempotent and quiet when nothing runs
//! - Operations rejected from the wrong status
//! - Worker exits on its own (clean and failing)
//! - Restart and shutdown
//!
//! Workers are small `sh` scripts written to a temp dir.

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;
    use tempfile::TempDir;

    use warden_core::WardenError;
    use warden_core::types::WorkerStatus;

    use crate::auto_recovery::RestartPolicy;
    use crate::broadcast::{Delivery, LifecycleEvent, SupervisorEvent};
    use crate::supervisor::{Supervisor, SupervisorConfig};
    use crate::types::LaunchSpec;

    fn worker(dir: &TempDir, body: &str) -> LaunchSpec {
        let path = dir.path().join("worker.sh");
        std::fs::write(&path, body).unwrap();
        LaunchSpec::new(path).with_interpreter("sh")
    }

    fn supervisor(spec: LaunchSpec, policy: RestartPolicy) -> Supervisor {
        Supervisor::new(
            SupervisorConfig::new(spec)
                .with_policy(policy.with_health_check_interval(Duration::from_millis(100)))
                .with_startup_grace(Duration::from_millis(200))
                .with_shutdown_grace(Duration::from_secs(2)),
        )
    }

    async fn wait_for_status(supervisor: &Supervisor, status: WorkerStatus) {
        let mut rx = supervisor.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.status == status))
            .await
            .expect("timed out waiting for status")
            .expect("state channel closed");
    }

    fn drain(sub: &mut crate::broadcast::Subscription) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        while let Some(delivery) = sub.try_recv() {
            if let Delivery::Event(event) = delivery {
                events.push(event);
            }
        }
        events
    }

    // =============================================================================
    // Start / Stop Tests
    // =============================================================================

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            worker(&dir, "echo ready\nexec sleep 30\n"),
            RestartPolicy::default(),
        );

        let state = sup.start().await.unwrap();
        assert_eq!(state.status, WorkerStatus::Running);
        assert!(state.process_id.is_some());
        assert!(state.started_at.is_some());
        assert!(state.is_consistent());

        let state = sup.stop().await.unwrap();
        assert_eq!(state.status, WorkerStatus::Stopped);
        assert!(state.process_id.is_none());
        assert!(state.started_at.is_none());
        assert_eq!(state.last_exit.and_then(|e| e.signal), Some(15));
        assert!(state.is_consistent());
    }

    #[tokio::test]
    async fn test_output_is_captured() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            worker(&dir, "echo one\necho two >&2\necho three\nexec sleep 30\n"),
            RestartPolicy::default(),
        );

        sup.start().await.unwrap();
        let logs = sup.recent_logs(100);
        let texts: Vec<_> = logs.iter().map(|l| l.text.as_str()).collect();
        assert!(texts.contains(&"one"));
        assert!(texts.contains(&"two"));
        assert!(texts.contains(&"three"));
        assert!(logs.windows(2).all(|w| w[0].id < w[1].id));

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_quiet() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(worker(&dir, "exec sleep 30\n"), RestartPolicy::default());
        let mut sub = sup.subscribe();

        let state = sup.stop().await.unwrap();
        assert_eq!(state.status, WorkerStatus::Stopped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(worker(&dir, "exec sleep 30\n"), RestartPolicy::default());

        sup.start().await.unwrap();
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, WardenError::AlreadyRunning));
        assert!(sup.snapshot().is_consistent());

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_rejected_while_starting() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(worker(&dir, "exec sleep 30\n"), RestartPolicy::default());

        let starter = sup.clone();
        let start = tokio::spawn(async move { starter.start().await });
        wait_for_status(&sup, WorkerStatus::Starting).await;

        let err = sup.stop().await.unwrap_err();
        assert!(matches!(
            err,
            WardenError::InvalidTransition {
                from: WorkerStatus::Starting,
                ..
            }
        ));

        start.await.unwrap().unwrap();
        sup.stop().await.unwrap();
    }

    // =============================================================================
    // Worker Exit Tests
    // =============================================================================

    #[tokio::test]
    async fn test_crash_without_auto_restart() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            worker(&dir, "echo started\nsleep 0.5\nexit 1\n"),
            RestartPolicy::disabled(),
        );
        let mut sub = sup.subscribe();

        sup.start().await.unwrap();
        wait_for_status(&sup, WorkerStatus::Error).await;

        // Nothing should follow
        tokio::time::sleep(Duration::from_millis(300)).await;
        let state = sup.snapshot();
        assert_eq!(state.status, WorkerStatus::Error);
        assert!(state.last_error.as_deref().unwrap().contains("exit code 1"));
        assert_eq!(state.restart_attempts, 0);
        assert!(state.is_consistent());

        let events = drain(&mut sub);
        let starts = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Status { state, .. } if state.status == WorkerStatus::Starting))
            .count();
        assert_eq!(starts, 1);
        assert!(!events.iter().any(|e| matches!(
            e,
            SupervisorEvent::Lifecycle(LifecycleEvent::RestartScheduled { .. })
        )));
    }

    #[tokio::test]
    async fn test_clean_exit_stops_without_restart() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            worker(&dir, "sleep 0.4\nexit 0\n"),
            RestartPolicy::default().with_retry_delay(Duration::from_millis(50)),
        );

        sup.start().await.unwrap();
        wait_for_status(&sup, WorkerStatus::Stopped).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = sup.snapshot();
        assert_eq!(state.status, WorkerStatus::Stopped);
        assert_eq!(state.last_exit.and_then(|e| e.code), Some(0));
        assert!(state.last_error.is_none());
        assert!(state.is_consistent());
    }

    #[tokio::test]
    async fn test_missing_script_records_error() {
        let dir = TempDir::new().unwrap();
        let spec = LaunchSpec::new(dir.path().join("missing.py")).with_interpreter("sh");
        let sup = supervisor(spec, RestartPolicy::default());

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, WardenError::ScriptNotFound { .. }));

        let state = sup.snapshot();
        assert_eq!(state.status, WorkerStatus::Error);
        assert!(state.last_error.as_deref().unwrap().contains("not found"));
        assert!(state.is_consistent());

        // Stopping from error keeps the error visible
        let state = sup.stop().await.unwrap();
        assert_eq!(state.status, WorkerStatus::Error);
    }

    // =============================================================================
    // Restart / Shutdown Tests
    // =============================================================================

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(
            worker(&dir, "exec sleep 30\n"),
            RestartPolicy::default().with_retry_delay(Duration::from_millis(50)),
        );
        let mut sub = sup.subscribe();

        let first = sup.start().await.unwrap();
        let second = sup.restart().await.unwrap();

        assert_eq!(second.status, WorkerStatus::Running);
        assert_ne!(first.process_id, second.process_id);

        let events = drain(&mut sub);
        assert!(events.contains(&SupervisorEvent::Lifecycle(LifecycleEvent::Stopped)));
        assert!(events.contains(&SupervisorEvent::Lifecycle(LifecycleEvent::Restarted {
            attempt: 0
        })));

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_starts() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(worker(&dir, "exec sleep 30\n"), RestartPolicy::default());

        sup.start().await.unwrap();
        sup.shutdown().await.unwrap();
        assert_eq!(sup.snapshot().status, WorkerStatus::Stopped);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, WardenError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_clean_exit_under_fast_health_polling() {
        let dir = TempDir::new().unwrap();
        let spec = worker(&dir, "sleep 0.25\nexit 0\n");

        // Polling every 10ms keeps landing ticks between exit and reap
        for _ in 0..5 {
            let sup = Supervisor::new(
                SupervisorConfig::new(spec.clone())
                    .with_policy(
                        RestartPolicy::default()
                            .with_health_check_interval(Duration::from_millis(10))
                            .with_retry_delay(Duration::from_millis(20)),
                    )
                    .with_startup_grace(Duration::from_millis(100)),
            );
            let mut sub = sup.subscribe();

            sup.start().await.unwrap();
            wait_for_status(&sup, WorkerStatus::Stopped).await;
            tokio::time::sleep(Duration::from_millis(100)).await;

            let state = sup.snapshot();
            assert_eq!(state.status, WorkerStatus::Stopped);
            assert_eq!(state.last_exit.and_then(|e| e.code), Some(0));
            assert!(state.last_error.is_none(), "{:?}", state.last_error);

            for event in drain(&mut sub) {
                assert!(
                    !matches!(
                        event,
                        SupervisorEvent::Lifecycle(
                            LifecycleEvent::Error { .. } | LifecycleEvent::RestartScheduled { .. }
                        )
                    ),
                    "clean exit treated as failure: {event:?}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_observers_are_counted() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(worker(&dir, "exec sleep 30\n"), RestartPolicy::default());
        assert_eq!(sup.subscriber_count(), 0);

        let first = sup.subscribe();
        let _second = sup.subscribe();
        assert_eq!(sup.subscriber_count(), 2);

        drop(first);
        assert_eq!(sup.subscriber_count(), 1);
        assert_eq!(sup.watch_state().borrow().status, WorkerStatus::Stopped);
    }
}
