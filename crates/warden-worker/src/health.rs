//! OS-level liveness checks for the worker process.
//!
//! ## Health Checks
//!
//! 1. **Exit**: the process handle has not recorded an exit
//! 2. **Process**: the PID exists (signal-0 probe) and is not a zombie
//!
//! Checks do not look inside the worker; a hung but alive process passes.
//! The supervisor's health loop runs [`HealthMonitor::check`] every
//! `health_check_interval` while the worker is running and forces a restart
//! through the auto-restart policy when a check fails.
//!
//! A child that has exited but is not reaped yet is a zombie and fails the
//! PID check. The supervisor waits briefly for that exit before treating a
//! failure as a dead worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::launcher::ProcessHandle;

/// Default health check interval (30 seconds).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Types of health checks that can be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    /// The handle has not observed an exit
    ExitRecorded,
    /// The PID exists and is not a zombie
    PidExists,
}

impl std::fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExitRecorded => write!(f, "Exit"),
            Self::PidExists => write!(f, "PID"),
        }
    }
}

/// Types of health errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthErrorType {
    /// Process has exited or vanished
    DeadProcess,
    /// Process is a zombie
    Zombie,
}

impl std::fmt::Display for HealthErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadProcess => write!(f, "dead process"),
            Self::Zombie => write!(f, "zombie"),
        }
    }
}

/// Result of a single health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Type of check performed
    pub check_type: HealthCheckType,
    /// Whether the check passed
    pub passed: bool,
    /// Error type if check failed
    pub error_type: Option<HealthErrorType>,
    /// Human-readable error message
    pub error_message: Option<String>,
    /// Timestamp of the check
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Create a passing health check result.
    pub fn passed(check_type: HealthCheckType) -> Self {
        Self {
            check_type,
            passed: true,
            error_type: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a failing health check result.
    pub fn failed(
        check_type: HealthCheckType,
        error_type: HealthErrorType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check_type,
            passed: false,
            error_type: Some(error_type),
            error_message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    /// Failure reason suitable for `lastError`.
    pub fn reason(&self) -> String {
        match (&self.error_type, &self.error_message) {
            (_, Some(message)) => message.clone(),
            (Some(error_type), None) => error_type.to_string(),
            (None, None) => "health check failed".to_string(),
        }
    }
}

/// Liveness checker for the worker process.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl HealthMonitor {
    /// Create a monitor polling every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Poll interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check the process behind `handle`.
    pub fn check(&self, handle: &ProcessHandle) -> HealthCheckResult {
        if let Some(exit) = handle.exit_status() {
            return HealthCheckResult::failed(
                HealthCheckType::ExitRecorded,
                HealthErrorType::DeadProcess,
                format!("worker exited ({exit})"),
            );
        }

        let result = check_pid(handle.pid);
        debug!(
            pid = handle.pid,
            passed = result.passed,
            check = %result.check_type,
            "health check"
        );
        result
    }
}

/// Check that `pid` exists and is not a zombie.
#[cfg(unix)]
pub fn check_pid(pid: u32) -> HealthCheckResult {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return HealthCheckResult::failed(
            HealthCheckType::PidExists,
            HealthErrorType::DeadProcess,
            format!("invalid pid {pid}"),
        );
    };

    match kill(Pid::from_raw(raw), None) {
        // EPERM means the process exists but belongs to someone else
        Ok(()) | Err(Errno::EPERM) => {}
        Err(e) => {
            return HealthCheckResult::failed(
                HealthCheckType::PidExists,
                HealthErrorType::DeadProcess,
                format!("worker process {pid} not found ({e})"),
            );
        }
    }

    if is_zombie(pid) {
        return HealthCheckResult::failed(
            HealthCheckType::PidExists,
            HealthErrorType::Zombie,
            format!("worker process {pid} is a zombie"),
        );
    }

    HealthCheckResult::passed(HealthCheckType::PidExists)
}

#[cfg(not(unix))]
pub fn check_pid(_pid: u32) -> HealthCheckResult {
    HealthCheckResult::passed(HealthCheckType::PidExists)
}

/// Reads `/proc/<pid>/stat`; the state field follows the parenthesized name.
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    let stat_path = format!("/proc/{pid}/stat");
    match std::fs::read_to_string(stat_path) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|state| state == "Z")
            .unwrap_or(false),
        // No procfs (macOS) or the process just went away
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_constructors() {
        let ok = HealthCheckResult::passed(HealthCheckType::PidExists);
        assert!(ok.passed);
        assert!(ok.error_type.is_none());

        let bad = HealthCheckResult::failed(
            HealthCheckType::PidExists,
            HealthErrorType::Zombie,
            "worker process 12 is a zombie",
        );
        assert!(!bad.passed);
        assert_eq!(bad.error_type, Some(HealthErrorType::Zombie));
        assert_eq!(bad.reason(), "worker process 12 is a zombie");
    }

    #[cfg(unix)]
    #[test]
    fn test_check_own_pid_passes() {
        let result = check_pid(std::process::id());
        assert!(result.passed, "{:?}", result.error_message);
    }

    #[cfg(unix)]
    #[test]
    fn test_check_missing_pid_fails() {
        // Above the default pid_max on Linux
        let result = check_pid(4_194_304 + 17);
        assert!(!result.passed);
        assert_eq!(result.error_type, Some(HealthErrorType::DeadProcess));
    }

    #[test]
    fn test_display() {
        assert_eq!(HealthCheckType::PidExists.to_string(), "PID");
        assert_eq!(HealthErrorType::DeadProcess.to_string(), "dead process");
        assert_eq!(HealthMonitor::default().interval(), Duration::from_secs(30));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unreaped_child_is_zombie() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let result = loop {
            let result = check_pid(child.id());
            if !result.passed || std::time::Instant::now() > deadline {
                break result;
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        assert_eq!(result.error_type, Some(HealthErrorType::Zombie));
        child.wait().unwrap();
    }
}
