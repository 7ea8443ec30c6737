//! Types for worker launch configuration and supervisor state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use warden_core::types::{ExitInfo, LogStream, WorkerStatus};

/// Default interpreter used to run the bot script.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Default bot script, relative to the working directory.
pub const DEFAULT_SCRIPT: &str = "bot.py";

/// How to launch the worker process.
///
/// The worker runs either directly (`script args...`) or through an
/// interpreter (`interpreter script args...`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSpec {
    /// Interpreter to run the script with, `None` to execute it directly
    pub interpreter: Option<String>,

    /// Path to the worker script or executable
    pub script: PathBuf,

    /// Extra arguments passed after the script
    pub args: Vec<String>,

    /// Working directory for the worker
    pub working_dir: Option<PathBuf>,

    /// Environment merged over the inherited one
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.insert("BOT_SERVICE_MODE".to_string(), "true".to_string());

        Self {
            interpreter: Some(DEFAULT_INTERPRETER.to_string()),
            script: PathBuf::from(DEFAULT_SCRIPT),
            args: Vec::new(),
            working_dir: None,
            env,
        }
    }
}

impl LaunchSpec {
    /// Create a spec that executes `script` directly with no extra environment.
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: None,
            script: script.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Run the script through an interpreter.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Append an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The program actually spawned: the interpreter if set, else the script.
    pub fn program(&self) -> String {
        match &self.interpreter {
            Some(interpreter) => interpreter.clone(),
            None => self.script.display().to_string(),
        }
    }

    /// Script path as seen from the worker's working directory.
    pub fn resolved_script(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) if self.script.is_relative() => dir.join(&self.script),
            _ => self.script.clone(),
        }
    }

    /// Full command line for display.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = Vec::with_capacity(self.args.len() + 2);
        if let Some(interpreter) = &self.interpreter {
            line.push(interpreter.clone());
        }
        line.push(self.script.display().to_string());
        line.extend(self.args.iter().cloned());
        line
    }

    /// Working directory, if any, as a path.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

/// Snapshot of the supervised worker.
///
/// `process_id` is set exactly when the status has a live process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub process_id: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_attempts: u32,
    pub last_update: DateTime<Utc>,
    pub last_exit: Option<ExitInfo>,
    /// Seconds since `started_at` while a process is live
    #[serde(default)]
    pub uptime_secs: u64,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            process_id: None,
            started_at: None,
            last_error: None,
            restart_attempts: 0,
            last_update: Utc::now(),
            last_exit: None,
            uptime_secs: 0,
        }
    }
}

impl WorkerState {
    /// Checks the process id invariant.
    pub fn is_consistent(&self) -> bool {
        self.process_id.is_some() == self.status.has_process()
    }

    /// Recompute `uptime_secs` against `now`.
    pub fn refresh_uptime(&mut self, now: DateTime<Utc>) {
        self.uptime_secs = match (self.status.has_process(), self.started_at) {
            (true, Some(started)) => (now - started).num_seconds().max(0) as u64,
            _ => 0,
        };
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic sequence number, unique per supervisor
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}
