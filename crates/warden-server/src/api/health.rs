//! Service health and probe routes.

use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use warden_core::types::WorkerStatus;
use warden_worker::WorkerState;

use crate::AppState;
use crate::response::{ApiError, ApiResponse, ApiResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub service: &'static str,
    pub version: &'static str,
    /// Seconds since the service started
    pub uptime_secs: u64,
    pub worker: WorkerState,
    pub subscribers: usize,
}

/// GET /health
///
/// Always 200 while the service is serving; the worker may be in any state.
pub async fn health(State(state): State<AppState>) -> ApiResponse<HealthReport> {
    ApiResponse::ok(HealthReport {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        worker: state.supervisor.snapshot(),
        subscribers: state.supervisor.subscriber_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct Probe {
    pub status: WorkerStatus,
}

/// GET /health/ready
pub async fn ready(State(state): State<AppState>) -> ApiResult<Probe> {
    let worker = state.supervisor.snapshot();
    if worker.status == WorkerStatus::Error {
        let reason = worker
            .last_error
            .unwrap_or_else(|| "worker is in error state".to_string());
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_READY",
            reason,
        ));
    }
    Ok(ApiResponse::ok(Probe {
        status: worker.status,
    }))
}

/// GET /health/live
pub async fn live() -> ApiResponse<&'static str> {
    ApiResponse::ok("alive")
}
