//! Worker process launcher.
//!
//! Spawns the worker, pumps its stdout/stderr into the
//! [`EventBroadcaster`](crate::broadcast::EventBroadcaster) line by line, and
//! reports the exit through a callback. Termination escalates from SIGTERM
//! to SIGKILL after a grace period.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use warden_core::log_worker_event;
use warden_core::types::{ExitInfo, LogStream};
use warden_core::{Result, WardenError};

use crate::broadcast::EventBroadcaster;
use crate::types::LaunchSpec;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Called once with the generation and exit information when the process ends.
pub type ExitCallback = Box<dyn FnOnce(u64, ExitInfo) + Send + 'static>;

/// Handle to one spawned worker process.
///
/// Clones share the same process. The handle never owns the child itself;
/// a background waiter task does, so exit is observed even if every handle
/// is dropped.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// OS process id
    pub pid: u32,
    /// Supervisor generation this process belongs to
    pub generation: u64,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
}

impl ProcessHandle {
    /// Exit information, if the process has exited.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Returns true while no exit has been observed.
    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Wait until the process exits.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            // Waiter gone; whatever it last recorded is final
            Err(_) => *self.exit_rx.borrow(),
        };
        exit.unwrap_or_default()
    }

    /// Ask the process to shut down (SIGTERM).
    pub fn signal_graceful(&self) {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let Ok(raw) = i32::try_from(self.pid) else {
                self.force_kill();
                return;
            };
            match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => debug!(pid = self.pid, "sent SIGTERM"),
                Err(Errno::ESRCH) => debug!(pid = self.pid, "process already gone"),
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "SIGTERM failed, killing");
                    self.force_kill();
                }
            }
        }
        #[cfg(not(unix))]
        self.force_kill();
    }

    /// Kill the process immediately (SIGKILL).
    pub fn force_kill(&self) {
        // Full channel means a kill is already queued
        let _ = self.kill_tx.try_send(());
    }
}

/// Spawns and tracks the single worker process.
#[derive(Debug, Default)]
pub struct WorkerLauncher {
    current: Option<ProcessHandle>,
}

impl WorkerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of the current process, if any.
    pub fn current(&self) -> Option<&ProcessHandle> {
        self.current.as_ref()
    }

    /// Spawn the worker.
    ///
    /// Output lines are published to `broadcaster`; `on_exit` runs once the
    /// process has exited and its exit status is recorded on the handle.
    #[instrument(
        level = "info",
        skip(self, spec, broadcaster, on_exit),
        fields(program = %spec.program())
    )]
    pub async fn launch(
        &mut self,
        spec: &LaunchSpec,
        generation: u64,
        broadcaster: &EventBroadcaster,
        on_exit: ExitCallback,
    ) -> Result<ProcessHandle> {
        if self.current.as_ref().is_some_and(ProcessHandle::is_alive) {
            return Err(WardenError::AlreadyRunning);
        }

        validate_script(&spec.resolved_script()).await?;

        let mut command = match &spec.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&spec.script);
                command
            }
            None => Command::new(&spec.script),
        };
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = spec.working_dir() {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| WardenError::spawn_failure(spec.program(), e))?;

        let pid = child
            .id()
            .ok_or_else(|| WardenError::internal("spawned worker has no pid"))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, LogStream::Stdout, broadcaster.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, LogStream::Stderr, broadcaster.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!(pid, error = %e, "failed to collect worker exit status");
                    ExitInfo::default()
                }
            };

            log_worker_event!(generation, "exited", pid, exit = %exit);
            exit_tx.send_replace(Some(exit));
            on_exit(generation, exit);
        });

        let handle = ProcessHandle {
            pid,
            generation,
            exit_rx,
            kill_tx,
        };
        self.current = Some(handle.clone());

        log_worker_event!(generation, "spawned", pid);
        Ok(handle)
    }

    /// Forget the handle of `generation` once its exit has been processed.
    pub fn reap(&mut self, generation: u64) -> Option<ProcessHandle> {
        if self.current.as_ref().is_some_and(|h| h.generation == generation) {
            return self.current.take();
        }
        None
    }

    /// Kill and forget a handle left behind by a failed process.
    ///
    /// Used before relaunching from `error`, where the old process may still
    /// be on its way out.
    pub async fn clear_stale(&mut self, grace: Duration) {
        if let Some(handle) = self.current.take() {
            if handle.is_alive() {
                warn!(pid = handle.pid, "killing leftover worker process");
                handle.force_kill();
                if tokio::time::timeout(grace, handle.wait()).await.is_err() {
                    warn!(pid = handle.pid, "leftover worker did not exit");
                }
            }
        }
    }
}

/// Terminate the process: SIGTERM, wait up to `grace`, then SIGKILL.
#[instrument(level = "info", skip(handle), fields(pid = handle.pid))]
pub async fn terminate(handle: &ProcessHandle, grace: Duration) -> ExitInfo {
    if let Some(exit) = handle.exit_status() {
        return exit;
    }

    handle.signal_graceful();

    match tokio::time::timeout(grace, handle.wait()).await {
        Ok(exit) => {
            info!(%exit, "worker exited after SIGTERM");
            exit
        }
        Err(_) => {
            let err = WardenError::GracefulShutdownTimeout {
                grace_secs: grace.as_secs(),
            };
            warn!(error = %err, "escalating to SIGKILL");
            handle.force_kill();
            handle.wait().await
        }
    }
}

/// Check that the worker script exists.
async fn validate_script(path: &Path) -> Result<()> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => {
            debug!("Worker script validated: {}", path.display());
            Ok(())
        }
        Ok(false) => Err(WardenError::script_not_found(path)),
        Err(e) => Err(WardenError::io("checking worker script", path, e)),
    }
}

/// Read `reader` line by line into the broadcaster until EOF.
async fn pump_output<R>(reader: R, stream: LogStream, broadcaster: EventBroadcaster)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                debug!(target: "warden::worker_output", %stream, "{}", text);
                broadcaster.publish_log(stream, text);
            }
            Err(e) => {
                warn!(%stream, error = %e, "failed reading worker output");
                break;
            }
        }
    }
}
