//! In-process state of a running batch: cancellation, the task channel
//! between dispatcher and workers, live counters, and the worker roster.

use crate::constants::{COMPLETION_WINDOW, TASK_CHANNEL_FACTOR};
use crate::models::{Batch, BatchTask, Template, WorkerInfo};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live counters of a running batch.
///
/// Guarded by one mutex together with the completion-time ring buffer and
/// the single-shot `completing` flag, so exactly one completion fires per
/// batch.
pub(crate) struct BatchCounters {
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub error_counts: HashMap<String, u64>,
    /// Recent completion timestamps, newest at the back.
    pub recent: VecDeque<DateTime<Utc>>,
    pub completing: bool,
    /// Completions since the batch record was last persisted.
    pub since_persist: u32,
}

impl BatchCounters {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            completed: batch.completed,
            failed: batch.failed,
            dead: batch.dead,
            error_counts: batch.error_counts.clone(),
            recent: VecDeque::with_capacity(COMPLETION_WINDOW),
            completing: false,
            since_persist: 0,
        }
    }

    pub fn done(&self) -> u64 {
        self.completed + self.failed + self.dead
    }

    pub fn record_completion(&mut self, at: DateTime<Utc>) {
        self.completed += 1;
        self.since_persist += 1;
        if self.recent.len() == COMPLETION_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(at);
    }

    pub fn record_dead(&mut self, key: String) {
        self.dead += 1;
        self.since_persist += 1;
        *self.error_counts.entry(key).or_insert(0) += 1;
    }

    pub fn record_retry(&mut self, key: String) {
        *self.error_counts.entry(key).or_insert(0) += 1;
    }

    /// Observed throughput in tasks per second over the ring buffer.
    /// Needs at least two samples spanning a non-zero interval.
    pub fn rate(&self) -> Option<f64> {
        if self.recent.len() < 2 {
            return None;
        }
        let first = *self.recent.front()?;
        let last = *self.recent.back()?;
        let span_ms = (last - first).num_milliseconds();
        if span_ms <= 0 {
            return None;
        }
        Some(self.recent.len() as f64 / (span_ms as f64 / 1000.0))
    }
}

/// Everything the fibers of one running batch share.
pub(crate) struct RunningBatch {
    pub batch_id: String,
    pub template: Template,
    pub concurrency: usize,
    pub total: u64,
    pub cancel: CancellationToken,
    pub tasks_tx: mpsc::Sender<BatchTask>,
    pub tasks_rx: Arc<Mutex<mpsc::Receiver<BatchTask>>>,
    pub counters: Mutex<BatchCounters>,
    pub workers: Mutex<Vec<WorkerInfo>>,
    pub handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RunningBatch {
    pub fn new(batch: &Batch, workers: Vec<WorkerInfo>, cancel: CancellationToken) -> Self {
        let capacity = batch.concurrency.max(1) * TASK_CHANNEL_FACTOR;
        let (tasks_tx, tasks_rx) = mpsc::channel(capacity);
        Self {
            batch_id: batch.id.clone(),
            template: batch.template.clone(),
            concurrency: batch.concurrency.max(1),
            total: batch.total,
            cancel,
            tasks_tx,
            tasks_rx: Arc::new(Mutex::new(tasks_rx)),
            counters: Mutex::new(BatchCounters::from_batch(batch)),
            workers: Mutex::new(workers),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn workers_snapshot(&self) -> Vec<WorkerInfo> {
        self.workers.lock().await.clone()
    }

    pub async fn set_worker_busy(&self, worker_id: &str, task_id: &str) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            worker.busy = true;
            worker.current_task = Some(task_id.to_string());
        }
    }

    pub async fn set_worker_idle(&self, worker_id: &str) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            worker.busy = false;
            worker.current_task = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BatchStatus;
    use chrono::Duration;

    fn counters() -> BatchCounters {
        let batch = Batch::new(
            "user1".to_string(),
            "demo".to_string(),
            "claude".to_string(),
            Template {
                prompt: "p".to_string(),
                timeout_secs: 300,
                max_retries: 0,
            },
            2,
            10,
        );
        assert_eq!(batch.status, BatchStatus::Pending);
        BatchCounters::from_batch(&batch)
    }

    #[test]
    fn test_rate_requires_two_samples() {
        let mut c = counters();
        assert!(c.rate().is_none());
        c.record_completion(Utc::now());
        assert!(c.rate().is_none());
    }

    #[test]
    fn test_rate_over_window() {
        let mut c = counters();
        let start = Utc::now();
        for i in 0..5 {
            c.record_completion(start + Duration::seconds(i));
        }
        // 5 samples across 4 seconds.
        let rate = c.rate().unwrap();
        assert!((rate - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut c = counters();
        let start = Utc::now();
        for i in 0..(COMPLETION_WINDOW as i64 + 50) {
            c.record_completion(start + Duration::milliseconds(i));
        }
        assert_eq!(c.recent.len(), COMPLETION_WINDOW);
        assert_eq!(c.completed, COMPLETION_WINDOW as u64 + 50);
    }

    #[test]
    fn test_record_dead_updates_histogram() {
        let mut c = counters();
        c.record_dead("boom".to_string());
        c.record_dead("boom".to_string());
        assert_eq!(c.dead, 2);
        assert_eq!(c.error_counts.get("boom"), Some(&2));
        assert_eq!(c.done(), 2);
    }
}
