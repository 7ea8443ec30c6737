//! Fan-out of worker state changes and output to observers.
//!
//! The [`EventBroadcaster`] owns three things:
//!
//! - the current [`WorkerState`] snapshot, held in a `watch` channel so reads
//!   never wait on the supervisor lock or on process I/O
//! - a bounded [`LogBuffer`] of recent output lines (oldest evicted first)
//! - a `broadcast` channel delivering [`SupervisorEvent`]s to every
//!   [`Subscription`]
//!
//! Subscribers are independent: a slow one skips what it missed and is told
//! how many events were dropped, and dropping one affects nobody else.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use warden_core::types::{LogStream, WorkerStatus};

use crate::types::{LogLine, WorkerState};

/// Default ring buffer capacity for worker output.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Capacity of the event channel before slow subscribers start lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Lifecycle notifications, in addition to plain status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    /// The worker survived the startup grace period
    Started { pid: u32 },
    /// The worker was stopped on request
    Stopped,
    /// The worker came back after a restart
    #[serde(rename_all = "camelCase")]
    Restarted { attempt: u32 },
    /// An automatic restart is pending
    #[serde(rename_all = "camelCase")]
    RestartScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    /// Automatic restarts are exhausted; reported once per exhausted run
    MaxRestartAttemptsReached { attempts: u32 },
    /// The worker failed
    Error { message: String },
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SupervisorEvent {
    /// The worker state changed
    Status {
        state: WorkerState,
        previous: WorkerStatus,
    },
    /// A line of worker output
    Log(LogLine),
    /// Lifecycle notification
    Lifecycle(LifecycleEvent),
}

impl SupervisorEvent {
    /// Short name, used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Log(_) => "log",
            Self::Lifecycle(_) => "lifecycle",
        }
    }
}

/// A ring buffer of worker output lines.
///
/// Uses VecDeque with a maximum capacity. When the buffer is full,
/// new lines push out the oldest ones.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
    /// Total lines ever added (for stats)
    total_added: u64,
    /// Lines evicted due to capacity limits
    dropped_count: u64,
}

impl LogBuffer {
    /// Create a new log buffer with the specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(10_000)),
            capacity,
            total_added: 0,
            dropped_count: 0,
        }
    }

    /// Push a line, evicting the oldest one when full.
    pub fn push(&mut self, line: LogLine) {
        if self.capacity == 0 {
            self.dropped_count += 1;
            self.total_added += 1;
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.dropped_count += 1;
        }
        self.lines.push_back(line);
        self.total_added += 1;
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// The last `n` lines, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Buffer statistics reported alongside recent logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub buffered: usize,
    pub capacity: usize,
    pub total_added: u64,
    pub dropped: u64,
}

struct LogRing {
    buffer: LogBuffer,
    next_id: u64,
}

struct Shared {
    state: watch::Sender<WorkerState>,
    events: broadcast::Sender<SupervisorEvent>,
    logs: Mutex<LogRing>,
}

/// Publishes worker state and output to any number of observers.
///
/// Cheap to clone; all clones share the same channels and buffer. Only the
/// supervisor and the launcher publish; everyone else reads.
///
/// ```compile_fail
/// use warden_worker::{EventBroadcaster, LifecycleEvent};
///
/// let broadcaster = EventBroadcaster::new(10);
/// broadcaster.publish_lifecycle(LifecycleEvent::Stopped);
/// ```
#[derive(Clone)]
pub struct EventBroadcaster {
    shared: Arc<Shared>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl EventBroadcaster {
    /// Create a broadcaster keeping up to `log_capacity` output lines.
    pub fn new(log_capacity: usize) -> Self {
        let (state, _) = watch::channel(WorkerState::default());
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                state,
                events,
                logs: Mutex::new(LogRing {
                    buffer: LogBuffer::new(log_capacity),
                    next_id: 1,
                }),
            }),
        }
    }

    /// Copy of the current worker state.
    pub fn snapshot(&self) -> WorkerState {
        let mut state = self.shared.state.borrow().clone();
        state.refresh_uptime(Utc::now());
        state
    }

    /// Watch the worker state directly.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    /// The most recent `min(limit, capacity)` lines, oldest first.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogLine> {
        match self.shared.logs.lock() {
            Ok(ring) => ring.buffer.last_n(limit),
            Err(poisoned) => poisoned.into_inner().buffer.last_n(limit),
        }
    }

    /// Current buffer statistics.
    pub fn log_stats(&self) -> LogStats {
        let ring = match self.shared.logs.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        LogStats {
            buffered: ring.buffer.len(),
            capacity: ring.buffer.capacity(),
            total_added: ring.buffer.total_added(),
            dropped: ring.buffer.dropped_count(),
        }
    }

    /// Record a line of output and deliver it to subscribers.
    pub(crate) fn publish_log(&self, stream: LogStream, text: impl Into<String>) -> LogLine {
        let line = {
            let mut ring = match self.shared.logs.lock() {
                Ok(ring) => ring,
                Err(poisoned) => poisoned.into_inner(),
            };
            let line = LogLine {
                id: ring.next_id,
                timestamp: Utc::now(),
                stream,
                text: text.into(),
            };
            ring.next_id += 1;
            ring.buffer.push(line.clone());
            line
        };

        self.send(SupervisorEvent::Log(line.clone()));
        line
    }

    /// Replace the state snapshot and announce the change.
    ///
    /// Only the supervisor's single writer path calls this.
    pub(crate) fn publish_state(&self, mut state: WorkerState, previous: WorkerStatus) {
        state.refresh_uptime(Utc::now());
        self.shared.state.send_replace(state.clone());
        self.send(SupervisorEvent::Status { state, previous });
    }

    /// Announce a lifecycle event.
    pub(crate) fn publish_lifecycle(&self, event: LifecycleEvent) {
        debug!(?event, "lifecycle event");
        self.send(SupervisorEvent::Lifecycle(event));
    }

    /// Register a new independent subscriber.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.shared.events.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.events.receiver_count()
    }

    fn send(&self, event: SupervisorEvent) {
        // No subscribers is not an error
        let _ = self.shared.events.send(event);
    }
}

/// What a subscriber receives next.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(SupervisorEvent),
    /// The subscriber fell behind and this many events were skipped
    Lagged(u64),
}

/// A single subscriber's view of the event stream.
pub struct Subscription {
    rx: broadcast::Receiver<SupervisorEvent>,
}

impl Subscription {
    /// Wait for the next delivery. Returns `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.rx.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber lagged, events dropped");
                Some(Delivery::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Next event, skipping over lag notices.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.recv().await? {
                Delivery::Event(event) => return Some(event),
                Delivery::Lagged(_) => continue,
            }
        }
    }

    /// Non-blocking receive, used by tests and drains.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => Some(Delivery::Lagged(skipped)),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(id: u64, text: &str) -> LogLine {
        LogLine {
            id,
            timestamp: Utc::now(),
            stream: LogStream::Stdout,
            text: text.to_string(),
        }
    }

    // ============================================================
    // LogBuffer (Ring Buffer) Tests
    // ============================================================

    #[test]
    fn test_log_buffer_eviction() {
        let mut buffer = LogBuffer::new(3);
        for i in 1..=5 {
            buffer.push(line(i, &i.to_string()));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_added(), 5);
        assert_eq!(buffer.dropped_count(), 2);

        let texts: Vec<_> = buffer.last_n(10).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["3", "4", "5"]);
    }

    #[test]
    fn test_log_buffer_last_n_chronological() {
        let mut buffer = LogBuffer::new(10);
        for i in 1..=6 {
            buffer.push(line(i, &format!("line {i}")));
        }

        let last = buffer.last_n(2);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].id, 5);
        assert_eq!(last[1].id, 6);
        assert!(buffer.last_n(0).is_empty());
    }

    // ============================================================
    // Broadcaster Tests
    // ============================================================

    #[test]
    fn test_recent_logs_bounded_by_capacity() {
        let broadcaster = EventBroadcaster::new(4);
        for i in 0..10 {
            broadcaster.publish_log(LogStream::Stdout, format!("line {i}"));
        }

        let logs = broadcaster.recent_logs(100);
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[0].text, "line 6");
        assert_eq!(logs[3].text, "line 9");
        assert!(logs.windows(2).all(|w| w[0].id < w[1].id));

        let stats = broadcaster.log_stats();
        assert_eq!(stats.buffered, 4);
        assert_eq!(stats.total_added, 10);
        assert_eq!(stats.dropped, 6);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let broadcaster = EventBroadcaster::default();
        let mut first = broadcaster.subscribe();
        let second = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(second);
        broadcaster.publish_log(LogStream::Stderr, "boom");

        match first.recv().await {
            Some(Delivery::Event(SupervisorEvent::Log(line))) => {
                assert_eq!(line.text, "boom");
                assert_eq!(line.stream, LogStream::Stderr);
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let broadcaster = EventBroadcaster::default();
        let mut slow = broadcaster.subscribe();

        for i in 0..(DEFAULT_EVENT_CAPACITY + 10) {
            broadcaster.publish_log(LogStream::Stdout, format!("{i}"));
        }

        match slow.recv().await {
            Some(Delivery::Lagged(skipped)) => assert_eq!(skipped, 10),
            other => panic!("expected lag notice, got {other:?}"),
        }
        assert!(matches!(slow.recv().await, Some(Delivery::Event(_))));
    }

    #[tokio::test]
    async fn test_publish_state_updates_snapshot() {
        let broadcaster = EventBroadcaster::default();
        let mut sub = broadcaster.subscribe();

        let state = WorkerState {
            status: WorkerStatus::Error,
            last_error: Some("exit code 1".into()),
            ..WorkerState::default()
        };
        broadcaster.publish_state(state, WorkerStatus::Running);

        assert_eq!(broadcaster.snapshot().status, WorkerStatus::Error);
        match sub.next_event().await {
            Some(SupervisorEvent::Status { state, previous }) => {
                assert_eq!(previous, WorkerStatus::Running);
                assert_eq!(state.last_error.as_deref(), Some("exit code 1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_names() {
        let event = SupervisorEvent::Lifecycle(LifecycleEvent::Stopped);
        assert_eq!(event.name(), "lifecycle");

        let json = serde_json::to_value(LifecycleEvent::MaxRestartAttemptsReached { attempts: 3 })
            .unwrap();
        assert_eq!(json["event"], "maxRestartAttemptsReached");
        assert_eq!(json["attempts"], 3);
    }
}
