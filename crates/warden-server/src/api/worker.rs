//! Worker control routes.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use warden_worker::{LogLine, LogStats, WorkerState};

use crate::AppState;
use crate::response::{ApiResponse, ApiResult};

/// Lines returned by `/logs` when no limit is given.
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// GET /status
pub async fn status(State(state): State<AppState>) -> ApiResponse<WorkerState> {
    ApiResponse::ok(state.supervisor.snapshot())
}

/// POST /start
pub async fn start(State(state): State<AppState>) -> ApiResult<WorkerState> {
    info!("start requested");
    let worker = state.supervisor.start().await?;
    Ok(ApiResponse::ok(worker).with_message("Worker started"))
}

/// POST /stop
pub async fn stop(State(state): State<AppState>) -> ApiResult<WorkerState> {
    info!("stop requested");
    let worker = state.supervisor.stop().await?;
    Ok(ApiResponse::ok(worker).with_message("Worker stopped"))
}

/// POST /restart
pub async fn restart(State(state): State<AppState>) -> ApiResult<WorkerState> {
    info!("restart requested");
    let worker = state.supervisor.restart().await?;
    Ok(ApiResponse::ok(worker).with_message("Worker restarted"))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Kept raw so a bad value falls back to the default instead of
    /// rejecting the request
    pub limit: Option<String>,
}

/// Parse a line count; missing, malformed or zero values give `DEFAULT_LOG_LIMIT`.
pub fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_LOG_LIMIT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    pub logs: Vec<LogLine>,
    pub count: usize,
    pub stats: LogStats,
}

/// GET /logs?limit=N
pub async fn logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<LogsResponse> {
    let Query(query) = query?;
    let logs = state
        .supervisor
        .recent_logs(parse_limit(query.limit.as_deref()));
    Ok(ApiResponse::ok(LogsResponse {
        count: logs.len(),
        logs,
        stats: state.supervisor.log_stats(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartView {
    pub auto_restart: bool,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_ms: u64,
    pub stable_after_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Only the names; values may hold secrets
    pub env_keys: Vec<String>,
    pub restart: RestartView,
    pub startup_grace_ms: u64,
    pub shutdown_grace_ms: u64,
    pub log_capacity: usize,
    pub autostart: bool,
}

/// GET /config
pub async fn config(State(state): State<AppState>) -> Json<ApiResponse<ConfigView>> {
    let sup = state.supervisor.config();
    let policy = &sup.policy;

    Json(ApiResponse::ok(ConfigView {
        command: sup.spec.command_line(),
        working_dir: sup.spec.working_dir.clone(),
        env_keys: sup.spec.env.keys().cloned().collect(),
        restart: RestartView {
            auto_restart: policy.auto_restart,
            max_attempts: policy.max_attempts,
            retry_delay_ms: policy.retry_delay.as_millis() as u64,
            health_check_interval_ms: policy.health_check_interval.as_millis() as u64,
            stable_after_ms: policy.stable_after.as_millis() as u64,
        },
        startup_grace_ms: sup.startup_grace.as_millis() as u64,
        shutdown_grace_ms: sup.shutdown_grace.as_millis() as u64,
        log_capacity: sup.log_capacity,
        autostart: state.config.autostart,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(Some("25")), 25);
        assert_eq!(parse_limit(Some(" 7 ")), 7);
        assert_eq!(parse_limit(None), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit(Some("abc")), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit(Some("-3")), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit(Some("0")), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit(Some("")), DEFAULT_LOG_LIMIT);
    }
}
