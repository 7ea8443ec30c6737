//! Automatic restart policy for the worker.
//!
//! Restarts are driven only by unexpected exits: a non-zero exit code, death
//! by signal, or a failed health check. A requested stop never counts.
//!
//! ```
//! use warden_worker::auto_recovery::{RestartDecision, RestartPolicy, RestartTracker};
//!
//! let policy = RestartPolicy::default();
//! let mut tracker = RestartTracker::default();
//!
//! for attempt in 1..=3 {
//!     assert!(matches!(tracker.decide(&policy), RestartDecision::Retry { attempt: a, .. } if a == attempt));
//! }
//! assert!(matches!(
//!     tracker.decide(&policy),
//!     RestartDecision::Exhausted { attempts: 3, first_report: true }
//! ));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum consecutive automatic restarts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before each automatic restart.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default time the worker must stay running before attempts reset.
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(60);

/// Restart policy, fixed for the lifetime of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Restart the worker after unexpected exits
    pub auto_restart: bool,

    /// Consecutive automatic restarts before giving up
    pub max_attempts: u32,

    /// Delay before each automatic restart
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// How often the health monitor polls the worker
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Continuous running time after which the attempt counter resets
    #[serde(with = "humantime_serde")]
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            health_check_interval: crate::health::DEFAULT_CHECK_INTERVAL,
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }
}

impl RestartPolicy {
    /// Policy that never restarts.
    pub fn disabled() -> Self {
        Self {
            auto_restart: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }
}

/// What to do about an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Auto-restart is off; stay in error
    Disabled,
    /// The attempt cap is reached; `first_report` is true only the first time
    Exhausted { attempts: u32, first_report: bool },
    /// Restart after `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
}

/// Tracks consecutive automatic restarts.
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    attempts: u32,
    exhausted_reported: bool,
}

impl RestartTracker {
    /// Decide the next step and record the attempt if one is made.
    pub fn decide(&mut self, policy: &RestartPolicy) -> RestartDecision {
        if !policy.auto_restart {
            return RestartDecision::Disabled;
        }

        if self.attempts >= policy.max_attempts {
            let first_report = !self.exhausted_reported;
            self.exhausted_reported = true;
            return RestartDecision::Exhausted {
                attempts: self.attempts,
                first_report,
            };
        }

        self.attempts += 1;
        RestartDecision::Retry {
            attempt: self.attempts,
            delay: policy.retry_delay,
        }
    }

    /// Consecutive attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget all attempts (manual start/stop, or sustained running).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.exhausted_reported = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RestartPolicy::default();
        assert!(policy.auto_restart);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(5));
        assert_eq!(policy.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_disabled_never_retries() {
        let policy = RestartPolicy::disabled();
        let mut tracker = RestartTracker::default();
        assert_eq!(tracker.decide(&policy), RestartDecision::Disabled);
        assert_eq!(tracker.attempts(), 0);
    }

    #[test]
    fn test_exhausted_reported_once() {
        let policy = RestartPolicy::default().with_max_attempts(2);
        let mut tracker = RestartTracker::default();

        assert!(matches!(tracker.decide(&policy), RestartDecision::Retry { attempt: 1, .. }));
        assert!(matches!(tracker.decide(&policy), RestartDecision::Retry { attempt: 2, .. }));
        assert_eq!(
            tracker.decide(&policy),
            RestartDecision::Exhausted {
                attempts: 2,
                first_report: true
            }
        );
        assert_eq!(
            tracker.decide(&policy),
            RestartDecision::Exhausted {
                attempts: 2,
                first_report: false
            }
        );
    }

    #[test]
    fn test_reset_starts_over() {
        let policy = RestartPolicy::default().with_max_attempts(1);
        let mut tracker = RestartTracker::default();
        tracker.decide(&policy);
        tracker.decide(&policy);

        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert!(matches!(tracker.decide(&policy), RestartDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_zero_max_attempts_exhausts_immediately() {
        let policy = RestartPolicy::default().with_max_attempts(0);
        let mut tracker = RestartTracker::default();
        assert!(matches!(
            tracker.decide(&policy),
            RestartDecision::Exhausted { attempts: 0, first_report: true }
        ));
    }

    #[test]
    fn test_policy_humantime_durations() {
        let policy: RestartPolicy = serde_json::from_str(
            r#"{"auto_restart": false, "retry_delay": "250ms", "max_attempts": 5}"#,
        )
        .unwrap();
        assert!(!policy.auto_restart);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_delay, Duration::from_millis(250));
        assert_eq!(policy.stable_after, DEFAULT_STABLE_AFTER);
    }
}
