//! Response envelope shared by every REST route.
//!
//! Success:
//!
//! ```json
//! { "success": true, "data": { ... }, "message": "Worker started", "timestamp": "..." }
//! ```
//!
//! Failure:
//!
//! ```json
//! { "success": false, "error": { "message": "...", "code": "ALREADY_RUNNING" }, "timestamp": "..." }
//! ```

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use warden_core::WardenError;

/// Error details inside a failed envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

/// The JSON envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Successful response carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<()> {
    /// Failed response.
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                message: message.into(),
                code: code.into(),
            }),
            message: None,
            timestamp: Utc::now(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Error returned from handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

/// HTTP status for a supervisor error.
pub fn status_for(err: &WardenError) -> StatusCode {
    match err {
        e if e.is_state_conflict() => StatusCode::CONFLICT,
        WardenError::ScriptNotFound { .. } => StatusCode::NOT_FOUND,
        WardenError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!(error = %err, code = err.code(), "request failed");
        } else {
            warn!(error = %err, code = err.code(), "request rejected");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        warn!(error = %rejection.body_text(), "bad query string");
        Self::new(
            StatusCode::BAD_REQUEST,
            "INVALID_QUERY",
            rejection.body_text(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::failure(self.code, self.message)),
        )
            .into_response()
    }
}

/// Result type for handlers.
pub type ApiResult<T> = std::result::Result<ApiResponse<T>, ApiError>;
