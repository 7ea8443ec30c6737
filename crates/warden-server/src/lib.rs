//! # warden-server
//!
//! HTTP control surface for the supervised worker.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/status` | Current worker state |
//! | POST | `/start` | Start the worker |
//! | POST | `/stop` | Stop the worker |
//! | POST | `/restart` | Stop, wait the retry delay, start |
//! | GET | `/logs?limit=N` | Most recent output lines |
//! | GET | `/config` | Effective launch and restart settings |
//! | GET | `/health` | Service health summary |
//! | GET | `/health/ready` | 503 while the worker is in error |
//! | GET | `/health/live` | Always 200 while the process serves |
//! | GET | `/events?logs=N` | Server-sent event stream |
//!
//! Every JSON route answers with the [`response::ApiResponse`] envelope.

pub mod api;
pub mod response;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, Request, Uri, header};
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use warden_config::WardenConfig;
use warden_worker::Supervisor;

use crate::response::ApiError;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub config: Arc<WardenConfig>,
    pub started_at: Instant,
    /// Cancelled when the service begins shutting down; ends event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(supervisor: Supervisor, config: WardenConfig) -> Self {
        Self {
            supervisor,
            config: Arc::new(config),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origin);
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id,
                )
            }),
        )
        .layer(PropagateRequestIdLayer::new(request_id))
        .layer(cors);

    Router::new()
        .route("/status", get(api::worker::status))
        .route("/start", post(api::worker::start))
        .route("/stop", post(api::worker::stop))
        .route("/restart", post(api::worker::restart))
        .route("/logs", get(api::worker::logs))
        .route("/config", get(api::worker::config))
        .route("/health", get(api::health::health))
        .route("/health/ready", get(api::health::ready))
        .route("/health/live", get(api::health::live))
        .route("/events", get(api::events::events))
        .fallback(not_found)
        .layer(middleware)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    match HeaderValue::from_str(origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true),
        Err(e) => {
            warn!(%origin, error = %e, "Invalid CORS origin, cross-origin requests disabled");
            CorsLayer::new()
        }
    }
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {uri}"))
}
