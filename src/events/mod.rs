//! Per-batch event fan-out.
//!
//! Subscribers receive batch, worker, and task events over bounded
//! channels. Publishing is lossy: a subscriber that cannot keep up loses
//! events rather than back-pressuring the scheduler. Broadcast holds the
//! subscriber map's read lock only for the duration of non-blocking sends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::constants::EVENT_BUFFER_SIZE;

/// The closed set of event kinds the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "batch.started")]
    BatchStarted,
    #[serde(rename = "batch.progress")]
    BatchProgress,
    #[serde(rename = "batch.paused")]
    BatchPaused,
    #[serde(rename = "batch.resumed")]
    BatchResumed,
    #[serde(rename = "batch.completed")]
    BatchCompleted,
    #[serde(rename = "batch.failed")]
    BatchFailed,
    #[serde(rename = "batch.cancelled")]
    BatchCancelled,
    #[serde(rename = "worker.started")]
    WorkerStarted,
    #[serde(rename = "worker.stopped")]
    WorkerStopped,
    #[serde(rename = "worker.error")]
    WorkerError,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BatchStarted => "batch.started",
            EventKind::BatchProgress => "batch.progress",
            EventKind::BatchPaused => "batch.paused",
            EventKind::BatchResumed => "batch.resumed",
            EventKind::BatchCompleted => "batch.completed",
            EventKind::BatchFailed => "batch.failed",
            EventKind::BatchCancelled => "batch.cancelled",
            EventKind::WorkerStarted => "worker.started",
            EventKind::WorkerStopped => "worker.stopped",
            EventKind::WorkerError => "worker.error",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
        }
    }
}

/// One published event with its JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEvent {
    pub batch_id: String,
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl BatchEvent {
    pub fn new<T: Serialize>(batch_id: &str, kind: EventKind, payload: &T) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            kind,
            data: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            at: Utc::now(),
        }
    }
}

/// Payload for `batch.progress`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressPayload {
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub percent: f64,
    pub eta: String,
    pub tasks_per_sec: f64,
}

/// Payload for `task.started`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStartedPayload {
    pub task_id: String,
    pub task_index: u64,
    pub worker_id: String,
}

/// Payload for `task.completed`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCompletedPayload {
    pub task_id: String,
    pub task_index: u64,
    pub worker_id: String,
    pub duration_ms: u64,
}

/// Payload for `task.failed`. `error` carries a `"DEAD: "` prefix when the
/// failure is final.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailedPayload {
    pub task_id: String,
    pub task_index: u64,
    pub worker_id: String,
    pub duration_ms: u64,
    pub error: String,
}

/// Payload for `worker.started`, `worker.stopped`, and `worker.error`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPayload {
    pub worker_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<BatchEvent>,
}

/// Bounded, lossy fan-out of events to per-batch subscribers.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a subscriber for a batch. Returns the subscriber id (for
    /// unsubscribe) and the event receiver.
    pub async fn subscribe(&self, batch_id: &str) -> (Uuid, mpsc::Receiver<BatchEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let id = Uuid::new_v4();
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(batch_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Removes one subscriber and releases its channel.
    pub async fn unsubscribe(&self, batch_id: &str, id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(batch_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                subscribers.remove(batch_id);
            }
        }
    }

    /// Drops every subscriber of a batch. Used when a batch is deleted.
    pub async fn remove_batch(&self, batch_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(batch_id);
    }

    /// Broadcasts an event to the batch's subscribers. Never blocks: a
    /// full subscriber channel drops the event for that subscriber only.
    pub async fn publish(&self, event: BatchEvent) {
        let subscribers = self.subscribers.read().await;
        let Some(subs) = subscribers.get(&event.batch_id) else {
            return;
        };
        for sub in subs {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                debug!(
                    "Dropping {} event for slow subscriber {} of batch {}",
                    event.kind.as_str(),
                    sub.id,
                    event.batch_id
                );
            }
        }
    }
}
