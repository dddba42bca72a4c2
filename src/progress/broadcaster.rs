// ABOUTME: Per-application progress log with replay-then-live fan-out.
// ABOUTME: Subscribers joining late receive the full history before live events.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::event::ProgressEvent;
use crate::types::ApplicationId;

/// Callback invoked for each delivered event.
///
/// Callbacks run while the application's log is locked and must not call back
/// into the broadcaster for the same application.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Default)]
struct LogState {
    events: Vec<ProgressEvent>,
    subscribers: Vec<(u64, ProgressCallback)>,
    final_event: Option<ProgressEvent>,
}

impl LogState {
    fn is_complete(&self) -> bool {
        self.final_event.is_some()
    }
}

/// Handle returned by [`ProgressBroadcaster::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    pub app_id: ApplicationId,
    pub id: u64,
    /// Number of buffered events replayed on subscribe.
    pub replayed: usize,
    /// Whether the log had already reached a terminal event.
    pub is_complete: bool,
    pub final_event: Option<ProgressEvent>,
}

/// In-memory progress buffer shared by every deployment in the process.
///
/// Logs are retained until [`clear`](Self::clear) is called; nothing expires
/// on its own.
#[derive(Default)]
pub struct ProgressBroadcaster {
    logs: Mutex<HashMap<ApplicationId, Arc<Mutex<LogState>>>>,
    next_id: AtomicU64,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, app_id: &ApplicationId) -> Arc<Mutex<LogState>> {
        Arc::clone(self.logs.lock().entry(app_id.clone()).or_default())
    }

    /// Append an event and deliver it to every current subscriber.
    pub fn emit(&self, app_id: &ApplicationId, event: ProgressEvent) {
        let log = self.log(app_id);
        let mut state = log.lock();
        state.events.push(event.clone());
        if event.stage.is_terminal() {
            state.final_event = Some(event.clone());
        }
        for (id, callback) in &state.subscribers {
            deliver(app_id, *id, callback, &event);
        }
    }

    /// Replay the buffered log to `callback`, then register it for live events.
    ///
    /// Replay and registration happen under the same lock as `emit`, so the
    /// subscriber sees every event exactly once.
    pub fn subscribe(&self, app_id: &ApplicationId, callback: ProgressCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let log = self.log(app_id);
        let mut state = log.lock();
        for event in &state.events {
            deliver(app_id, id, &callback, event);
        }
        state.subscribers.push((id, callback));
        Subscription {
            app_id: app_id.clone(),
            id,
            replayed: state.events.len(),
            is_complete: state.is_complete(),
            final_event: state.final_event.clone(),
        }
    }

    /// Subscribe through an unbounded channel for async consumers.
    pub fn subscribe_channel(
        &self,
        app_id: &ApplicationId,
    ) -> (Subscription, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(
            app_id,
            Arc::new(move |event: &ProgressEvent| {
                let _ = tx.send(event.clone());
            }),
        );
        (subscription, rx)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let log = self.logs.lock().get(&subscription.app_id).cloned();
        if let Some(log) = log {
            log.lock()
                .subscribers
                .retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Snapshot of the buffered events for an application.
    pub fn events(&self, app_id: &ApplicationId) -> Vec<ProgressEvent> {
        let log = self.logs.lock().get(app_id).cloned();
        log.map(|l| l.lock().events.clone()).unwrap_or_default()
    }

    pub fn is_complete(&self, app_id: &ApplicationId) -> bool {
        let log = self.logs.lock().get(app_id).cloned();
        log.is_some_and(|l| l.lock().is_complete())
    }

    pub fn final_event(&self, app_id: &ApplicationId) -> Option<ProgressEvent> {
        let log = self.logs.lock().get(app_id).cloned();
        log.and_then(|l| l.lock().final_event.clone())
    }

    /// Number of live subscribers for an application.
    pub fn subscriber_count(&self, app_id: &ApplicationId) -> usize {
        let log = self.logs.lock().get(app_id).cloned();
        log.map(|l| l.lock().subscribers.len()).unwrap_or(0)
    }

    /// Drop an application's log once its result has been consumed.
    ///
    /// Subscribers still registered are dropped with it.
    pub fn clear(&self, app_id: &ApplicationId) {
        self.logs.lock().remove(app_id);
    }

    /// Start a fresh log for a new attempt, keeping live subscribers.
    pub fn reset(&self, app_id: &ApplicationId) {
        let log = self.log(app_id);
        let mut state = log.lock();
        state.events.clear();
        state.final_event = None;
    }
}

fn deliver(app_id: &ApplicationId, id: u64, callback: &ProgressCallback, event: &ProgressEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        tracing::warn!(
            "Progress subscriber {} for application {} panicked; continuing delivery",
            id,
            app_id
        );
    }
}
