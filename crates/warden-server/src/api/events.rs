//! Server-sent event stream.
//!
//! On connect a client gets one `status` event with the current snapshot and
//! one `logs` event with recent output, then live `status`, `log` and
//! `lifecycle` events. A client that falls behind gets a `lagged` event with
//! the number of skipped events. The stream ends when the service shuts down.

use async_stream::stream;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use warden_worker::{Delivery, SupervisorEvent};

use crate::AppState;
use crate::api::worker::parse_limit;
use crate::response::ApiError;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Recent log lines to replay on connect
    pub logs: Option<String>,
}

/// GET /events?logs=N
pub async fn events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Query(query) = query?;

    // Subscribe before taking the snapshot so nothing falls in between
    let mut subscription = state.supervisor.subscribe();
    let snapshot = state.supervisor.snapshot();
    let backlog = state
        .supervisor
        .recent_logs(parse_limit(query.logs.as_deref()));
    let shutdown = state.shutdown.clone();

    info!(
        subscribers = state.supervisor.subscriber_count(),
        "Event stream opened"
    );

    let stream = stream! {
        yield Event::default().event("status").json_data(&snapshot);
        yield Event::default().event("logs").json_data(&backlog);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => None,
                delivery = subscription.recv() => delivery,
            };
            match delivery {
                Some(Delivery::Event(event)) => yield to_sse(&event),
                Some(Delivery::Lagged(skipped)) => {
                    yield Event::default()
                        .event("lagged")
                        .json_data(serde_json::json!({ "skipped": skipped }));
                }
                None => break,
            }
        }

        debug!("Event stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

fn to_sse(event: &SupervisorEvent) -> Result<Event, axum::Error> {
    let sse = Event::default().event(event.name());
    match event {
        SupervisorEvent::Status { state, .. } => sse.json_data(state),
        SupervisorEvent::Log(line) => sse.json_data(line),
        SupervisorEvent::Lifecycle(lifecycle) => sse.json_data(lifecycle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_worker::LifecycleEvent;

    #[test]
    fn test_event_names() {
        let event = SupervisorEvent::Lifecycle(LifecycleEvent::Started { pid: 7 });
        assert_eq!(event.name(), "lifecycle");
        assert!(to_sse(&event).is_ok());
    }
}
