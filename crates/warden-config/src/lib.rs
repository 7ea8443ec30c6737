//! # warden-config
//!
//! Configuration for the warden service.
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. Built-in defaults
//! 2. A YAML file (`~/.warden/config.yaml` unless `--config` is given)
//! 3. Environment variables (see [`env`])
//!
//! ## Example
//!
//! ```yaml
//! server:
//!   port: 3002
//!   cors_origin: http://localhost:3000
//! worker:
//!   interpreter: python3
//!   script: bot.py
//!   working_dir: /srv/bot
//! restart:
//!   auto_restart: true
//!   max_attempts: 3
//!   retry_delay: 5s
//!   health_check_interval: 30s
//! autostart: false
//! ```

pub mod env;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use warden_core::{Result, WardenError};
use warden_worker::supervisor::{DEFAULT_STARTUP_GRACE, SupervisorConfig};
use warden_worker::{LaunchSpec, RestartPolicy};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3002;

/// Default allowed CORS origin (the dashboard dev server).
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

/// Overall ceiling for a graceful service shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// How to launch the worker
    pub worker: LaunchSpec,

    /// Automatic restart policy
    pub restart: RestartPolicy,

    /// Supervisor timings and buffers
    pub supervisor: SupervisorSettings,

    /// Start the worker when the service boots
    pub autostart: bool,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Supervisor timings and buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// How long a fresh process must survive to count as running
    #[serde(with = "humantime_serde")]
    pub startup_grace: Duration,

    /// Time between SIGTERM and SIGKILL
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Ceiling for the whole service shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Worker output lines kept in memory
    pub log_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_grace: DEFAULT_STARTUP_GRACE,
            shutdown_grace: warden_worker::launcher::DEFAULT_SHUTDOWN_GRACE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_capacity: warden_worker::broadcast::DEFAULT_LOG_CAPACITY,
        }
    }
}

impl WardenConfig {
    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without one, the default
    /// file is used if present and defaults otherwise. Environment overrides
    /// are applied on top and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => match config_path() {
                Some(path) if path.exists() => Self::load_from(&path)?,
                _ => {
                    debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };

        env::apply_process_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific YAML file, without overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| WardenError::config_not_found(path, e))?;
        let config = Self::parse(&content, path)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| WardenError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.worker.script.as_os_str().is_empty() {
            return Err(WardenError::config_validation("worker.script must not be empty"));
        }
        if self
            .worker
            .interpreter
            .as_deref()
            .is_some_and(|i| i.trim().is_empty())
        {
            return Err(WardenError::config_validation(
                "worker.interpreter must not be empty when set",
            ));
        }
        if self.restart.retry_delay.is_zero() {
            return Err(WardenError::config_validation("restart.retry_delay must be > 0"));
        }
        if self.restart.health_check_interval.is_zero() {
            return Err(WardenError::config_validation(
                "restart.health_check_interval must be > 0",
            ));
        }
        if self.supervisor.startup_grace.is_zero() {
            return Err(WardenError::config_validation(
                "supervisor.startup_grace must be > 0",
            ));
        }
        if self.supervisor.shutdown_timeout < self.supervisor.shutdown_grace {
            return Err(WardenError::config_validation(format!(
                "supervisor.shutdown_timeout ({:?}) must be at least shutdown_grace ({:?})",
                self.supervisor.shutdown_timeout, self.supervisor.shutdown_grace
            )));
        }
        if self.supervisor.log_capacity == 0 {
            return Err(WardenError::config_validation(
                "supervisor.log_capacity must be > 0",
            ));
        }
        if self.server.port == 0 {
            return Err(WardenError::config_validation("server.port must be > 0"));
        }
        Ok(())
    }

    /// Supervisor settings derived from this configuration.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::new(self.worker.clone())
            .with_policy(self.restart.clone())
            .with_startup_grace(self.supervisor.startup_grace)
            .with_shutdown_grace(self.supervisor.shutdown_grace)
            .with_log_capacity(self.supervisor.log_capacity)
    }
}

/// Default config file path (`~/.warden/config.yaml`).
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".warden").join("config.yaml"))
}
