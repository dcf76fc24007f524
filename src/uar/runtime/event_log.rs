//! Per-run, append-only event buffers.
//!
//! Every run gets its own [`RunLog`]; appends take the run's lock only, so
//! runs never contend with each other. Subscribers read by cursor from the
//! buffer and use a `watch` channel purely as a wake-up, which keeps delivery
//! gap-free and never blocks the producer on a slow consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use futures::Stream;
use tokio::sync::watch;

use crate::uar::domain::events::{RunEvent, RunEventKind};
use crate::uar::domain::runs::RunStatus;

#[derive(Debug)]
struct RunLog {
    run_id: String,
    state: Mutex<LogState>,
    // Carries the current event count.
    notify: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<RunEvent>,
    terminal: Option<RunStatus>,
}

impl RunLog {
    fn new(run_id: &str) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            run_id: run_id.to_string(),
            state: Mutex::new(LogState::default()),
            notify,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Atomic view of a run's buffered events.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub events: Vec<RunEvent>,
    /// Set once the terminal event has been appended.
    pub terminal: Option<RunStatus>,
}

impl LogSnapshot {
    pub fn count(&self) -> u64 {
        self.events.len() as u64
    }
}

/// Registry of event logs, shared by the run manager and the streaming gateway.
#[derive(Debug, Clone, Default)]
pub struct RunEventLog {
    runs: Arc<RwLock<HashMap<String, Arc<RunLog>>>>,
}

impl RunEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the log for `run_id` if it does not exist yet.
    pub fn open(&self, run_id: &str) {
        self.log_or_create(run_id);
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.log(run_id).is_some()
    }

    /// Append an event, assigning the next index. Returns `None` once the log
    /// has been closed by a terminal event.
    pub fn append(&self, run_id: &str, kind: RunEventKind) -> Option<RunEvent> {
        let log = self.log_or_create(run_id);
        let mut state = log.lock();
        if state.terminal.is_some() {
            tracing::warn!(
                run_id = %run_id,
                event_type = kind.event_type(),
                "Dropping event appended after terminal state"
            );
            return None;
        }

        let event = RunEvent {
            run_id: log.run_id.clone(),
            event_index: state.events.len() as u64,
            timestamp: Utc::now(),
            kind,
        };
        if let Some(status) = event.kind.terminal_status() {
            state.terminal = Some(status);
        }
        state.events.push(event.clone());
        let count = state.events.len() as u64;
        drop(state);

        log.notify.send_replace(count);
        Some(event)
    }

    pub fn len(&self, run_id: &str) -> u64 {
        self.log(run_id)
            .map_or(0, |log| log.lock().events.len() as u64)
    }

    pub fn is_empty(&self, run_id: &str) -> bool {
        self.len(run_id) == 0
    }

    pub fn snapshot(&self, run_id: &str) -> Option<LogSnapshot> {
        let log = self.log(run_id)?;
        let state = log.lock();
        Some(LogSnapshot {
            events: state.events.clone(),
            terminal: state.terminal,
        })
    }

    /// Events with an index strictly greater than `after` (all when `None`).
    pub fn events_after(&self, run_id: &str, after: Option<u64>) -> Vec<RunEvent> {
        let Some(log) = self.log(run_id) else {
            return Vec::new();
        };
        let state = log.lock();
        let start = after.map_or(0, |n| n.saturating_add(1));
        let start = usize::try_from(start).unwrap_or(usize::MAX).min(state.events.len());
        state.events[start..].to_vec()
    }

    /// Snapshot the buffer and subscribe to everything after it in one step,
    /// so no event can fall between the two.
    pub fn snapshot_and_subscribe(&self, run_id: &str) -> Option<(LogSnapshot, EventSubscription)> {
        let log = self.log(run_id)?;
        let state = log.lock();
        let snapshot = LogSnapshot {
            events: state.events.clone(),
            terminal: state.terminal,
        };
        let subscription = EventSubscription {
            log: Arc::clone(&log),
            rx: log.notify.subscribe(),
            cursor: snapshot.count(),
        };
        drop(state);
        Some((snapshot, subscription))
    }

    /// Follow the log starting at `from_index`.
    pub fn subscribe(&self, run_id: &str, from_index: u64) -> Option<EventSubscription> {
        let log = self.log(run_id)?;
        Some(EventSubscription {
            rx: log.notify.subscribe(),
            log,
            cursor: from_index,
        })
    }

    /// Drop a run's buffer once no client needs to replay it.
    pub fn forget(&self, run_id: &str) {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }

    fn log(&self, run_id: &str) -> Option<Arc<RunLog>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    fn log_or_create(&self, run_id: &str) -> Arc<RunLog> {
        if let Some(log) = self.log(run_id) {
            return log;
        }
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            runs.entry(run_id.to_string())
                .or_insert_with(|| Arc::new(RunLog::new(run_id))),
        )
    }
}

/// Cursor over one run's events; ends after the terminal event.
#[derive(Debug)]
pub struct EventSubscription {
    log: Arc<RunLog>,
    rx: watch::Receiver<u64>,
    cursor: u64,
}

impl EventSubscription {
    /// Index of the next event this subscription will yield.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            // Mark the current version seen before looking at the buffer so an
            // append racing with the check still wakes `changed()` below.
            self.rx.borrow_and_update();
            {
                let state = self.log.lock();
                let index = usize::try_from(self.cursor).unwrap_or(usize::MAX);
                if let Some(event) = state.events.get(index) {
                    self.cursor += 1;
                    return Some(event.clone());
                }
                if state.terminal.is_some() {
                    return None;
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = RunEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }
}
