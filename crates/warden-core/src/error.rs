//! Error types for warden operations.
//!
//! This module defines [`WardenError`], the error enum shared by every warden
//! crate. Operation failures (`start`, `stop`, `restart`) are returned to the
//! caller of that operation; background failures never surface here and are
//! folded into the worker's `error` status instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::WorkerStatus;

/// Result type alias using [`WardenError`].
pub type Result<T> = std::result::Result<T, WardenError>;

/// Comprehensive error type for all warden operations.
#[derive(Debug, Error)]
pub enum WardenError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Worker Lifecycle Errors
    // =========================================================================
    /// A worker process is already running
    #[error("Worker is already running")]
    AlreadyRunning,

    /// A start is already in flight
    #[error("Worker is already starting")]
    AlreadyStarting,

    /// The requested operation is not allowed from the current status
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: WorkerStatus, to: WorkerStatus },

    /// The worker script or executable does not exist
    #[error("Worker script not found: {path}")]
    ScriptNotFound { path: PathBuf },

    /// The operating system refused to spawn the worker
    #[error("Failed to spawn worker {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker exited before the startup grace period elapsed
    #[error("Worker failed to start: {message}")]
    StartupFailed { message: String },

    /// The worker ignored the graceful termination signal.
    ///
    /// Never returned to callers: termination escalates to a forced kill.
    #[error("Worker did not exit within {grace_secs}s of SIGTERM")]
    GracefulShutdownTimeout { grace_secs: u64 },

    /// The supervisor is shutting down and refuses new work
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// HTTP listener could not be bound
    #[error("Failed to bind HTTP server on {addr}")]
    ServerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in warden)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WardenError {
    /// Create a ConfigNotFound error from the failed read
    pub fn config_not_found(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a ScriptNotFound error
    pub fn script_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ScriptNotFound { path: path.into() }
    }

    /// Create a SpawnFailure error
    pub fn spawn_failure(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailure {
            program: program.into(),
            source,
        }
    }

    /// Create a StartupFailed error
    pub fn startup_failed(message: impl Into<String>) -> Self {
        Self::StartupFailed {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if the error is a conflict with the worker's current status.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::AlreadyStarting | Self::InvalidTransition { .. }
        )
    }

    /// Returns true if the worker never got a process (nothing will exit).
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::ScriptNotFound { .. } | Self::SpawnFailure { .. })
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } | Self::ConfigValidation { .. }
        )
    }

    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "CONFIG_NOT_FOUND",
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::ConfigValidation { .. } => "CONFIG_VALIDATION",
            Self::Io { .. } | Self::DirectoryCreation { .. } => "IO_ERROR",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::AlreadyStarting => "ALREADY_STARTING",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ScriptNotFound { .. } => "SCRIPT_NOT_FOUND",
            Self::SpawnFailure { .. } => "SPAWN_FAILURE",
            Self::StartupFailed { .. } => "START_FAILED",
            Self::GracefulShutdownTimeout { .. } => "GRACEFUL_SHUTDOWN_TIMEOUT",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::ServerBind { .. } => "SERVER_BIND",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Check YAML syntax - try 'warden --check-config'"),
            Self::ScriptNotFound { .. } => {
                Some("Check BOT_SCRIPT_PATH or worker.script in the configuration")
            }
            Self::SpawnFailure { .. } => {
                Some("Check that the interpreter (PYTHON_PATH) exists and is executable")
            }
            Self::StartupFailed { .. } => Some("Inspect the worker logs via GET /logs"),
            Self::ServerBind { .. } => Some("Pick another port with --port or PORT"),
            _ => None,
        }
    }
}
