//! Worker supervision for warden.
//!
//! This crate spawns the bot worker, tracks its lifecycle, restarts it when
//! it fails, and streams its output to observers.
//!
//! # Overview
//!
//! - [`launcher`] spawns the process and captures stdout/stderr line by line
//! - [`state`] holds the lifecycle transition table
//! - [`health`] checks OS-level liveness of the process
//! - [`auto_recovery`] decides whether and when to restart
//! - [`broadcast`] fans out state, output and lifecycle events
//! - [`supervisor`] ties them together behind `start` / `stop` / `restart`
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use warden_worker::{LaunchSpec, RestartPolicy, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> warden_core::Result<()> {
//!     let spec = LaunchSpec::new("bot.py")
//!         .with_interpreter("python3")
//!         .with_working_dir("/srv/bot")
//!         .with_env("PYTHONUNBUFFERED", "1");
//!     let policy = RestartPolicy::default().with_retry_delay(Duration::from_secs(5));
//!
//!     let supervisor = Supervisor::new(SupervisorConfig::new(spec).with_policy(policy));
//!     let state = supervisor.start().await?;
//!     println!("worker running as pid {:?}", state.process_id);
//!
//!     for line in supervisor.recent_logs(20) {
//!         println!("[{}] {}", line.stream, line.text);
//!     }
//!
//!     supervisor.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod auto_recovery;
pub mod broadcast;
pub mod health;
pub mod launcher;
mod lifecycle_tests;
pub mod state;
pub mod supervisor;
pub mod types;

// Re-export main types for convenience
pub use auto_recovery::{RestartDecision, RestartPolicy, RestartTracker};
pub use broadcast::{
    Delivery, EventBroadcaster, LifecycleEvent, LogStats, Subscription, SupervisorEvent,
};
pub use health::{HealthCheckResult, HealthMonitor};
pub use launcher::{ProcessHandle, WorkerLauncher};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use types::{LaunchSpec, LogLine, WorkerState};
