//! The worker supervisor.
//!
//! # Architecture
//!
//! ```text
//! start / stop / restart ──▶ Core (lock) ──▶ EventBroadcaster ──▶ observers
//!                               ▲                  ▲
//!                               │ ControlEvent     │ log lines
//!          exit waiter ─────────┤                  │
//!          health loop ─────────┤            output readers
//!          retry timers ────────┘
//! ```
//!
//! Every state mutation happens while holding the core lock, either in a
//! public operation or in the dispatcher task that consumes
//! [`ControlEvent`]s. Background tasks never touch the state themselves.
//!
//! Each manual start opens a *session*. The health loop and any pending
//! retry timer belong to the session and are cancelled when it ends, which
//! happens on `stop()` or on the next manual start.

use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use warden_core::log_worker_event;
use warden_core::types::{ExitInfo, WorkerStatus};
use warden_core::{Result, WardenError};

use crate::auto_recovery::{RestartDecision, RestartPolicy, RestartTracker};
use crate::broadcast::{
    DEFAULT_LOG_CAPACITY, EventBroadcaster, LifecycleEvent, LogStats, Subscription,
};
use crate::health::HealthMonitor;
use crate::launcher::{DEFAULT_SHUTDOWN_GRACE, ExitCallback, ProcessHandle, WorkerLauncher, terminate};
use crate::state;
use crate::types::{LaunchSpec, LogLine, WorkerState};

/// Default time a fresh process must survive before it counts as running.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(2);

/// How long a failed health check waits for an exit already in flight.
const EXIT_SETTLE: Duration = Duration::from_secs(1);

/// Everything a supervisor needs; immutable once the supervisor exists.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub spec: LaunchSpec,
    pub policy: RestartPolicy,
    pub startup_grace: Duration,
    pub shutdown_grace: Duration,
    pub log_capacity: usize,
}

impl SupervisorConfig {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            policy: RestartPolicy::default(),
            startup_grace: DEFAULT_STARTUP_GRACE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }
}

/// Messages from background tasks to the dispatcher.
#[derive(Debug)]
enum ControlEvent {
    Exited { generation: u64, exit: ExitInfo },
    HealthPassed { generation: u64 },
    HealthFailed { generation: u64, reason: String },
    /// Health tick while the worker is in error
    FailedTick { session: u64 },
    RetryDue { session: u64, attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    Manual,
    AutoRestart,
}

struct Session {
    id: u64,
    token: CancellationToken,
}

struct Core {
    state: WorkerState,
    launcher: WorkerLauncher,
    generation: u64,
    session: Session,
    tracker: RestartTracker,
    /// An automatic start failed at launch; the next health tick retries
    restart_owed: bool,
    running_since: Option<Instant>,
    shutting_down: bool,
}

struct Inner {
    config: SupervisorConfig,
    broadcaster: EventBroadcaster,
    health: HealthMonitor,
    core: Mutex<Core>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

/// Supervises a single worker process.
///
/// Cheap to clone; clones control the same worker.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor with the worker stopped.
    ///
    /// Must be called from within a Tokio runtime: the dispatcher task is
    /// spawned here.
    pub fn new(config: SupervisorConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let broadcaster = EventBroadcaster::new(config.log_capacity);
        let health = HealthMonitor::new(config.policy.health_check_interval);

        let inner = Arc::new(Inner {
            config,
            broadcaster,
            health,
            core: Mutex::new(Core {
                state: WorkerState::default(),
                launcher: WorkerLauncher::new(),
                generation: 0,
                session: Session {
                    id: 0,
                    token: CancellationToken::new(),
                },
                tracker: RestartTracker::default(),
                restart_owed: false,
                running_since: None,
                shutting_down: false,
            }),
            control_tx,
        });

        tokio::spawn(run_dispatcher(Arc::downgrade(&inner), control_rx));
        Self { inner }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Start the worker and wait out the startup grace period.
    ///
    /// Returns the running state, or an error if the worker could not be
    /// launched or exited during the grace period.
    #[instrument(level = "info", skip(self))]
    pub async fn start(&self) -> Result<WorkerState> {
        let (handle, generation) = {
            let mut core = self.inner.core.lock().await;
            self.inner.launch_locked(&mut core, StartOrigin::Manual).await?
        };
        self.inner.await_startup(handle, generation).await
    }

    /// Stop the worker: SIGTERM, grace period, then SIGKILL.
    ///
    /// Stopping a stopped worker succeeds without emitting anything.
    #[instrument(level = "info", skip(self))]
    pub async fn stop(&self) -> Result<WorkerState> {
        let handle = {
            let mut core = self.inner.core.lock().await;
            match core.state.status {
                WorkerStatus::Stopped => {
                    self.inner.end_session(&mut core);
                    return Ok(self.snapshot());
                }
                WorkerStatus::Starting => {
                    return Err(WardenError::InvalidTransition {
                        from: WorkerStatus::Starting,
                        to: WorkerStatus::Stopping,
                    });
                }
                WorkerStatus::Error => {
                    self.inner.end_session(&mut core);
                    core.launcher
                        .clear_stale(self.inner.config.shutdown_grace)
                        .await;
                    if core.state.restart_attempts != 0 {
                        self.inner.amend(&mut core, |s| s.restart_attempts = 0);
                    }
                    return Ok(self.snapshot());
                }
                WorkerStatus::Stopping => None,
                WorkerStatus::Running => {
                    self.inner.end_session(&mut core);
                    let Some(handle) = core.launcher.current().cloned() else {
                        self.inner
                            .fail(&mut core, "worker process handle lost".to_string(), None);
                        return Err(WardenError::internal("running worker has no process handle"));
                    };
                    self.inner.transition(&mut core, WorkerStatus::Stopping, |s| {
                        s.restart_attempts = 0;
                    })?;
                    core.running_since = None;
                    log_worker_event!(handle.generation, "stopping", pid = handle.pid);
                    Some(handle)
                }
            }
        };

        if let Some(handle) = handle {
            terminate(&handle, self.inner.config.shutdown_grace).await;
        }

        // The dispatcher records the exit
        self.inner.wait_while(WorkerStatus::Stopping).await;
        Ok(self.snapshot())
    }

    /// Stop, wait the retry delay, then start again.
    #[instrument(level = "info", skip(self))]
    pub async fn restart(&self) -> Result<WorkerState> {
        {
            let core = self.inner.core.lock().await;
            if core.shutting_down {
                return Err(WardenError::ShuttingDown);
            }
            if core.state.status == WorkerStatus::Starting {
                return Err(WardenError::AlreadyStarting);
            }
        }

        self.stop().await?;
        tokio::time::sleep(self.inner.config.policy.retry_delay).await;

        let state = self.start().await?;
        self.inner
            .broadcaster
            .publish_lifecycle(LifecycleEvent::Restarted { attempt: 0 });
        Ok(state)
    }

    /// Refuse further starts and stop the worker.
    ///
    /// An in-flight start is allowed to settle first.
    #[instrument(level = "info", skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut core = self.inner.core.lock().await;
            core.shutting_down = true;
        }
        self.inner.wait_while(WorkerStatus::Starting).await;
        self.stop().await?;
        info!("supervisor shut down");
        Ok(())
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Copy of the current worker state.
    pub fn snapshot(&self) -> WorkerState {
        self.inner.broadcaster.snapshot()
    }

    /// The most recent `min(limit, capacity)` output lines, oldest first.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogLine> {
        self.inner.broadcaster.recent_logs(limit)
    }

    pub fn log_stats(&self) -> LogStats {
        self.inner.broadcaster.log_stats()
    }

    /// Subscribe to state changes, output and lifecycle events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.broadcaster.subscribe()
    }

    /// Watch the worker state; every change is observed in order of writes.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.broadcaster.watch_state()
    }

    /// Number of live event subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.broadcaster.subscriber_count()
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.inner.config.policy
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.inner.config.spec
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }
}

impl Inner {
    // =========================================================================
    // Single writer path
    // =========================================================================

    /// Apply a table transition and publish it.
    fn transition(
        &self,
        core: &mut Core,
        to: WorkerStatus,
        update: impl FnOnce(&mut WorkerState),
    ) -> Result<WorkerStatus> {
        let previous = state::apply_transition(&mut core.state, to, update)?;
        debug!(from = %previous, %to, "worker transition");
        self.broadcaster.publish_state(core.state.clone(), previous);
        Ok(previous)
    }

    /// Change fields without changing status.
    fn amend(&self, core: &mut Core, update: impl FnOnce(&mut WorkerState)) {
        update(&mut core.state);
        core.state.last_update = Utc::now();
        self.broadcaster
            .publish_state(core.state.clone(), core.state.status);
    }

    /// Move to `error`, recording why.
    fn fail(&self, core: &mut Core, message: String, exit: Option<ExitInfo>) {
        let recorded = message.clone();
        let result = self.transition(core, WorkerStatus::Error, |s| {
            s.process_id = None;
            s.started_at = None;
            s.last_error = Some(recorded);
            if exit.is_some() {
                s.last_exit = exit;
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to record worker error");
        }
        core.running_since = None;
        warn!(error = %message, "worker failed");
        self.broadcaster
            .publish_lifecycle(LifecycleEvent::Error { message });
    }

    /// Check status and spawn the process, leaving the worker in `starting`.
    async fn launch_locked(
        self: &Arc<Self>,
        core: &mut Core,
        origin: StartOrigin,
    ) -> Result<(ProcessHandle, u64)> {
        if core.shutting_down {
            return Err(WardenError::ShuttingDown);
        }
        match core.state.status {
            WorkerStatus::Running => return Err(WardenError::AlreadyRunning),
            WorkerStatus::Starting => return Err(WardenError::AlreadyStarting),
            WorkerStatus::Stopping => {
                return Err(WardenError::InvalidTransition {
                    from: WorkerStatus::Stopping,
                    to: WorkerStatus::Starting,
                });
            }
            WorkerStatus::Stopped | WorkerStatus::Error => {}
        }

        if origin == StartOrigin::Manual {
            self.begin_session(core);
        }

        core.launcher.clear_stale(self.config.shutdown_grace).await;
        core.generation += 1;
        let generation = core.generation;

        let tx = self.control_tx.clone();
        let on_exit: ExitCallback = Box::new(move |generation, exit| {
            let _ = tx.send(ControlEvent::Exited { generation, exit });
        });

        let launched = core
            .launcher
            .launch(&self.config.spec, generation, &self.broadcaster, on_exit)
            .await;

        match launched {
            Ok(handle) => {
                let attempts = core.tracker.attempts();
                let pid = handle.pid;
                self.transition(core, WorkerStatus::Starting, |s| {
                    s.process_id = Some(pid);
                    s.started_at = Some(Utc::now());
                    s.restart_attempts = attempts;
                })?;
                info!(pid, generation, ?origin, "worker starting");
                Ok((handle, generation))
            }
            Err(err) => {
                self.fail(core, err.to_string(), None);
                if origin == StartOrigin::AutoRestart {
                    core.restart_owed = true;
                }
                Err(err)
            }
        }
    }

    /// Wait out the startup grace period, then promote to `running`.
    async fn await_startup(&self, handle: ProcessHandle, generation: u64) -> Result<WorkerState> {
        let exited = tokio::select! {
            _ = tokio::time::sleep(self.config.startup_grace) => None,
            exit = handle.wait() => Some(exit),
        };

        if let Some(exit) = exited {
            // The dispatcher moves the worker to error
            self.wait_while(WorkerStatus::Starting).await;
            return Err(WardenError::startup_failed(startup_exit_message(exit)));
        }

        let mut core = self.core.lock().await;
        if core.generation != generation || core.state.status != WorkerStatus::Starting {
            let message = core
                .state
                .last_error
                .clone()
                .unwrap_or_else(|| "worker exited during startup".to_string());
            return Err(WardenError::startup_failed(message));
        }

        self.transition(&mut core, WorkerStatus::Running, |s| {
            s.last_error = None;
        })?;
        core.running_since = Some(Instant::now());
        log_worker_event!(generation, "running", pid = handle.pid);
        self.broadcaster
            .publish_lifecycle(LifecycleEvent::Started { pid: handle.pid });

        Ok(self.broadcaster.snapshot())
    }

    /// Wait until the status is no longer `status`.
    async fn wait_while(&self, status: WorkerStatus) {
        let mut rx = self.broadcaster.watch_state();
        let _ = rx.wait_for(|s| s.status != status).await;
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    fn begin_session(self: &Arc<Self>, core: &mut Core) {
        core.session.token.cancel();
        core.session = Session {
            id: core.session.id + 1,
            token: CancellationToken::new(),
        };
        core.tracker.reset();
        core.restart_owed = false;

        spawn_health_loop(
            Arc::downgrade(self),
            core.session.id,
            core.session.token.clone(),
            self.health.interval(),
        );
    }

    fn end_session(&self, core: &mut Core) {
        core.session.token.cancel();
        core.session = Session {
            id: core.session.id + 1,
            token: CancellationToken::new(),
        };
        core.tracker.reset();
        core.restart_owed = false;
    }

    // =========================================================================
    // Auto-restart
    // =========================================================================

    fn schedule_restart(&self, core: &mut Core) {
        let policy = &self.config.policy;
        match core.tracker.decide(policy) {
            RestartDecision::Disabled => {
                info!("auto-restart disabled, worker stays in error");
            }
            RestartDecision::Exhausted {
                attempts,
                first_report,
            } => {
                if first_report {
                    warn!(attempts, "maximum restart attempts reached");
                    self.broadcaster
                        .publish_lifecycle(LifecycleEvent::MaxRestartAttemptsReached { attempts });
                }
            }
            RestartDecision::Retry { attempt, delay } => {
                self.amend(core, |s| s.restart_attempts = attempt);
                info!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "restart scheduled"
                );
                self.broadcaster
                    .publish_lifecycle(LifecycleEvent::RestartScheduled {
                        attempt,
                        max_attempts: policy.max_attempts,
                        delay_ms: delay.as_millis() as u64,
                    });

                let token = core.session.token.clone();
                let session = core.session.id;
                let tx = self.control_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(ControlEvent::RetryDue { session, attempt });
                        }
                    }
                });
            }
        }
    }

    // =========================================================================
    // Dispatcher
    // =========================================================================

    async fn dispatch(self: &Arc<Self>, event: ControlEvent) {
        let mut core = self.core.lock().await;

        match event {
            ControlEvent::Exited { generation, exit } => {
                core.launcher.reap(generation);
                if generation != core.generation {
                    debug!(generation, "ignoring exit of stale process");
                    return;
                }

                match core.state.status {
                    WorkerStatus::Starting => {
                        self.fail(&mut core, startup_exit_message(exit), Some(exit));
                        if exit.is_failure() {
                            self.schedule_restart(&mut core);
                        }
                    }
                    WorkerStatus::Running if exit.is_success() => {
                        self.record_stopped(&mut core, exit);
                        info!("worker exited cleanly");
                    }
                    WorkerStatus::Running => {
                        self.fail(&mut core, format!("worker crashed ({exit})"), Some(exit));
                        self.schedule_restart(&mut core);
                    }
                    WorkerStatus::Stopping => {
                        self.record_stopped(&mut core, exit);
                    }
                    // Already handled, e.g. killed after a failed health check
                    WorkerStatus::Stopped | WorkerStatus::Error => {
                        if core.state.last_exit != Some(exit) {
                            self.amend(&mut core, |s| s.last_exit = Some(exit));
                        }
                    }
                }
            }

            ControlEvent::HealthPassed { generation } => {
                if generation != core.generation || core.state.status != WorkerStatus::Running {
                    return;
                }
                let stable = core
                    .running_since
                    .is_some_and(|since| since.elapsed() >= self.config.policy.stable_after);
                if stable && core.tracker.attempts() > 0 {
                    info!("worker stable, resetting restart attempts");
                    core.tracker.reset();
                    self.amend(&mut core, |s| s.restart_attempts = 0);
                }
            }

            ControlEvent::HealthFailed { generation, reason } => {
                if generation != core.generation || core.state.status != WorkerStatus::Running {
                    return;
                }
                if let Some(handle) = core.launcher.current() {
                    handle.force_kill();
                }
                self.fail(&mut core, format!("health check failed: {reason}"), None);
                self.schedule_restart(&mut core);
            }

            ControlEvent::FailedTick { session } => {
                if session == core.session.id
                    && core.restart_owed
                    && core.state.status == WorkerStatus::Error
                {
                    core.restart_owed = false;
                    self.schedule_restart(&mut core);
                }
            }

            ControlEvent::RetryDue { session, attempt } => {
                if session != core.session.id
                    || core.session.token.is_cancelled()
                    || core.state.status != WorkerStatus::Error
                {
                    debug!(session, attempt, "dropping superseded restart");
                    return;
                }

                match self.launch_locked(&mut core, StartOrigin::AutoRestart).await {
                    Ok((handle, generation)) => {
                        let inner = Arc::clone(self);
                        tokio::spawn(async move {
                            match inner.await_startup(handle, generation).await {
                                Ok(_) => inner
                                    .broadcaster
                                    .publish_lifecycle(LifecycleEvent::Restarted { attempt }),
                                Err(e) => debug!(attempt, error = %e, "automatic restart failed"),
                            }
                        });
                    }
                    Err(e) => warn!(attempt, error = %e, "automatic restart could not launch"),
                }
            }
        }
    }

    fn record_stopped(&self, core: &mut Core, exit: ExitInfo) {
        let result = self.transition(core, WorkerStatus::Stopped, |s| {
            s.process_id = None;
            s.started_at = None;
            s.last_exit = Some(exit);
        });
        match result {
            Ok(_) => self.broadcaster.publish_lifecycle(LifecycleEvent::Stopped),
            Err(e) => warn!(error = %e, "failed to record worker stop"),
        }
        core.running_since = None;
    }

    /// One health tick: inspect the process without holding the lock.
    async fn health_tick(&self, session: u64) {
        let (handle, status) = {
            let core = self.core.lock().await;
            if core.session.id != session {
                return;
            }
            (core.launcher.current().cloned(), core.state.status)
        };

        let event = match (status, handle) {
            (WorkerStatus::Running, Some(handle)) => {
                let result = self.health.check(&handle);
                if result.passed {
                    ControlEvent::HealthPassed {
                        generation: handle.generation,
                    }
                } else if let Ok(exit) = tokio::time::timeout(EXIT_SETTLE, handle.wait()).await {
                    // An exited but unreaped child fails the check too; the
                    // Exited event decides what happens
                    debug!(
                        generation = handle.generation,
                        %exit,
                        reason = %result.reason(),
                        "health check saw a pending exit"
                    );
                    return;
                } else {
                    ControlEvent::HealthFailed {
                        generation: handle.generation,
                        reason: result.reason(),
                    }
                }
            }
            (WorkerStatus::Error, _) => ControlEvent::FailedTick { session },
            _ => return,
        };
        let _ = self.control_tx.send(event);
    }
}

fn startup_exit_message(exit: ExitInfo) -> String {
    format!("worker exited during startup ({exit})")
}

async fn run_dispatcher(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<ControlEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(event).await;
    }
    debug!("supervisor dispatcher stopped");
}

fn spawn_health_loop(
    inner: Weak<Inner>,
    session: u64,
    token: CancellationToken,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.health_tick(session).await;
        }
        debug!(session, "health loop stopped");
    });
}
