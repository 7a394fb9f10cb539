//! Process-local queue implementation.
//!
//! Mirrors the Redis backend's state machine with a single in-process lock
//! providing claim atomicity. Suitable for single-node deployments and
//! tests; state does not survive the process.

use super::{QueueStats, TaskQueue};
use crate::models::QueueItem;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

struct ProcessingEntry {
    item: QueueItem,
    claimed_at: i64,
}

#[derive(Default)]
struct BatchQueueState {
    pending: VecDeque<QueueItem>,
    processing: Vec<ProcessingEntry>,
    dead: Vec<QueueItem>,
    claims: HashMap<String, String>,
}

/// Single-process task queue.
pub struct LocalQueue {
    claim_timeout: Duration,
    state: Mutex<HashMap<String, BatchQueueState>>,
}

impl LocalQueue {
    pub fn new(claim_timeout: Duration) -> Self {
        Self {
            claim_timeout,
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, batch_id: &str, items: &[QueueItem]) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state.entry(batch_id.to_string()).or_default();
        queue.pending.extend(items.iter().cloned());
        Ok(())
    }

    async fn claim(
        &self,
        batch_id: &str,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let mut state = self.state.lock().await;
        let Some(queue) = state.get_mut(batch_id) else {
            return Ok(Vec::new());
        };

        let now = Utc::now().timestamp();
        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(item) = queue.pending.pop_front() else {
                break;
            };
            queue
                .claims
                .insert(item.task_id.clone(), worker_id.to_string());
            queue.processing.push(ProcessingEntry {
                item: item.clone(),
                claimed_at: now,
            });
            claimed.push(item);
        }
        Ok(claimed)
    }

    async fn complete(&self, batch_id: &str, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.get_mut(batch_id) {
            queue.processing.retain(|e| e.item.task_id != task_id);
            queue.claims.remove(task_id);
        }
        Ok(())
    }

    async fn requeue(&self, batch_id: &str, task_id: &str, attempts: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state.entry(batch_id.to_string()).or_default();
        let mut item = match queue.processing.iter().position(|e| e.item.task_id == task_id) {
            Some(pos) => queue.processing.remove(pos).item,
            None => return Ok(()),
        };
        queue.claims.remove(task_id);
        item.attempts = attempts;
        queue.pending.push_back(item);
        Ok(())
    }

    async fn move_to_dead(
        &self,
        batch_id: &str,
        task_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = state.entry(batch_id.to_string()).or_default();

        let item = match queue.processing.iter().position(|e| e.item.task_id == task_id) {
            Some(pos) => {
                let mut item = queue.processing.remove(pos).item;
                item.attempts = attempts;
                item
            }
            // Late-arriving failure signal: record it in dead anyway.
            None => QueueItem {
                task_id: task_id.to_string(),
                batch_id: batch_id.to_string(),
                index: task_index_from_id(batch_id, task_id),
                attempts,
            },
        };
        queue.claims.remove(task_id);
        debug!("Task {} moved to dead letter: {}", task_id, error);
        queue.dead.push(item);
        Ok(())
    }

    async fn recover_timed_out(&self, batch_id: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(queue) = state.get_mut(batch_id) else {
            return Ok(0);
        };

        let cutoff = Utc::now().timestamp() - self.claim_timeout.as_secs() as i64;
        let mut expired: Vec<ProcessingEntry> = Vec::new();
        let mut keep: Vec<ProcessingEntry> = Vec::new();
        for entry in queue.processing.drain(..) {
            if entry.claimed_at <= cutoff {
                expired.push(entry);
            } else {
                keep.push(entry);
            }
        }
        queue.processing = keep;

        // Oldest claims requeue first.
        expired.sort_by_key(|e| e.claimed_at);
        let count = expired.len();
        for entry in expired {
            queue.claims.remove(&entry.item.task_id);
            queue.pending.push_back(entry.item);
        }
        Ok(count)
    }

    async fn list_dead(&self, batch_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        let state = self.state.lock().await;
        let Some(queue) = state.get(batch_id) else {
            return Ok(Vec::new());
        };
        let mut items: Vec<QueueItem> = queue.dead.clone();
        if limit > 0 {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn retry_dead(&self, batch_id: &str, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(queue) = state.get_mut(batch_id) else {
            return Ok(0);
        };

        let mut moved = 0;
        let mut remaining = Vec::new();
        for mut item in queue.dead.drain(..) {
            if ids.is_empty() || ids.contains(&item.task_id) {
                item.attempts = 0;
                queue.pending.push_back(item);
                moved += 1;
            } else {
                remaining.push(item);
            }
        }
        queue.dead = remaining;
        Ok(moved)
    }

    async fn stats(&self, batch_id: &str) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let Some(queue) = state.get(batch_id) else {
            return Ok(QueueStats::default());
        };
        Ok(QueueStats {
            pending: queue.pending.len() as u64,
            processing: queue.processing.len() as u64,
            dead: queue.dead.len() as u64,
        })
    }

    async fn cleanup(&self, batch_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.remove(batch_id);
        Ok(())
    }
}

/// Best-effort recovery of a task index from its `<batch>-<index>` id, for
/// dead entries synthesized without a processing record.
fn task_index_from_id(batch_id: &str, task_id: &str) -> u64 {
    task_id
        .strip_prefix(batch_id)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|idx| idx.parse().ok())
        .unwrap_or(0)
}
