//! Environment variable overrides.
//!
//! | Variable | Field | Format |
//! |---|---|---|
//! | `PYTHON_PATH` | `worker.interpreter` | program name or path |
//! | `BOT_SCRIPT_PATH` | `worker.script` | path |
//! | `BOT_WORKING_DIR` | `worker.working_dir` | path |
//! | `BOT_AUTO_RESTART` | `restart.auto_restart` | anything but `false` enables |
//! | `BOT_MAX_RESTART_ATTEMPTS` | `restart.max_attempts` | integer |
//! | `BOT_RESTART_DELAY` | `restart.retry_delay` | milliseconds |
//! | `BOT_HEALTH_CHECK_INTERVAL` | `restart.health_check_interval` | milliseconds |
//! | `HOST` | `server.host` | address |
//! | `PORT` | `server.port` | integer |
//! | `CORS_ORIGIN` | `server.cors_origin` | origin URL |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use warden_core::{Result, WardenError};

use crate::WardenConfig;

/// Apply overrides from the process environment.
pub fn apply_process_env(config: &mut WardenConfig) -> Result<()> {
    apply_env_with(config, |key| std::env::var(key).ok())
}

/// Apply overrides using `lookup` to read variables.
pub fn apply_env_with<F>(config: &mut WardenConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(interpreter) = get("PYTHON_PATH") {
        debug!(%interpreter, "PYTHON_PATH override");
        config.worker.interpreter = Some(interpreter);
    }
    if let Some(script) = get("BOT_SCRIPT_PATH") {
        config.worker.script = PathBuf::from(script);
    }
    if let Some(dir) = get("BOT_WORKING_DIR") {
        config.worker.working_dir = Some(PathBuf::from(dir));
    }
    if let Some(flag) = get("BOT_AUTO_RESTART") {
        config.restart.auto_restart = flag != "false";
    }
    if let Some(value) = get("BOT_MAX_RESTART_ATTEMPTS") {
        config.restart.max_attempts = parse("BOT_MAX_RESTART_ATTEMPTS", &value)?;
    }
    if let Some(value) = get("BOT_RESTART_DELAY") {
        config.restart.retry_delay = parse_millis("BOT_RESTART_DELAY", &value)?;
    }
    if let Some(value) = get("BOT_HEALTH_CHECK_INTERVAL") {
        config.restart.health_check_interval = parse_millis("BOT_HEALTH_CHECK_INTERVAL", &value)?;
    }
    if let Some(host) = get("HOST") {
        config.server.host = host;
    }
    if let Some(value) = get("PORT") {
        config.server.port = parse("PORT", &value)?;
    }
    if let Some(origin) = get("CORS_ORIGIN") {
        config.server.cors_origin = origin;
    }

    Ok(())
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        WardenError::config_validation(format!("{key} must be a non-negative integer, got '{value}'"))
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
