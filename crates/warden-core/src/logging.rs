//! Logging infrastructure for warden.
//!
//! Structured logging using the `tracing` ecosystem. The supervisor keeps its
//! own log files separate from the worker's captured output, which lives in
//! the in-memory ring buffer and is streamed to dashboard clients.
//!
//! ## Features
//!
//! - JSON lines format for machine parsing
//! - File output to `~/.warden/logs/warden.log` (rotated daily)
//! - Console output with configurable verbosity
//!
//! ## Example
//!
//! ```no_run
//! use warden_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("warden started");
//! tracing::debug!(generation = 3, "spawning worker");
//! ```

use std::path::PathBuf;

use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::error::{Result, WardenError};

/// Log targets owned by warden, used to build the default filter.
const WARDEN_TARGETS: &[&str] = &[
    "warden",
    "warden_core",
    "warden_config",
    "warden_worker",
    "warden_server",
    "tower_http",
];

/// Flushes the file writer when dropped; hold it until exit.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber: JSON lines to `<log_dir>/warden.log`
/// (daily rotation) plus compact stderr output.
///
/// `RUST_LOG` takes precedence over `verbose`. Fails if a global subscriber
/// is already installed.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = log_dir.map_or_else(default_log_dir, Ok)?;
    std::fs::create_dir_all(&log_dir).map_err(|source| WardenError::DirectoryCreation {
        path: log_dir.clone(),
        source,
    })?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "warden.log"));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(default_directives(if verbose { "debug" } else { "info" }))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_file_layer(file_writer))
        .with(console_layer(verbose))
        .try_init()
        .map_err(|e| WardenError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Span closes are recorded so request and worker spans carry timings.
fn json_file_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true)
}

fn console_layer<S>(verbose: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact()
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Build the default filter directives for the given level.
fn default_directives(level: &str) -> String {
    WARDEN_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Get the default log directory path.
///
/// Returns `~/.warden/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| WardenError::Internal {
        message: "home directory could not be determined".into(),
    })?;

    Ok(home.join(".warden").join("logs"))
}

/// Convenience macro for logging worker lifecycle events.
///
/// # Example
///
/// ```ignore
/// log_worker_event!(generation, "spawned", pid = 4242);
/// log_worker_event!(generation, "exited");
/// ```
#[macro_export]
macro_rules! log_worker_event {
    ($generation:expr, $event:expr) => {
        tracing::info!(
            target: "warden::worker",
            generation = $generation,
            event = $event,
            "worker event"
        )
    };
    ($generation:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "warden::worker",
            generation = $generation,
            event = $event,
            $($field)*,
            "worker event"
        )
    };
}
