//! Batch scheduling.
//!
//! The [`BatchManager`] owns batch CRUD and the full execution lifecycle:
//! it persists batches and tasks through the store, distributes task
//! references through the queue, provisions one container session per
//! worker, and runs three kinds of fibers per batch: workers, a dispatcher,
//! and a progress reporter. Cancellation flows top-down through a token
//! hierarchy (manager root, per-batch child, per-exec deadline).

mod dispatcher;
mod progress;
mod state;
mod worker;

#[cfg(test)]
mod tests;

use crate::constants;
use crate::events::{BatchEvent, EventBus, EventKind, WorkerPayload};
use crate::models::{
    Batch, BatchFilter, BatchStatus, BatchTask, QueueItem, TaskFilter, TaskStats, TaskStatus,
    Template, WorkerInfo,
};
use crate::queue::{LocalQueue, QueueStats, TaskQueue};
use crate::session::{SessionBackend, SessionState};
use crate::store::BatchStore;
use crate::template;
use crate::{Result, VesselError};
use chrono::Utc;
use serde_json::json;
use state::RunningBatch;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Classification of a task execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient (network, rate limit, timeout): retry up to the budget.
    Retryable,
    /// Non-retryable (validation, auth, oversized context): straight to
    /// the dead letter regardless of attempts remaining.
    Fatal,
    /// Provider switch requested. The scheduler dead-letters the task; the
    /// caller's multi-provider logic owns the rest.
    Fallover,
}

/// Pluggable predicate categorizing execution errors, supplied by the
/// caller.
pub type ErrorClassifier = Arc<dyn Fn(&str) -> ErrorClass + Send + Sync>;

/// Conservative default classifier: known permanent failures are fatal,
/// everything else retries.
pub fn default_classifier() -> ErrorClassifier {
    Arc::new(|error: &str| {
        let lowered = error.to_lowercase();
        let fatal = [
            "unauthorized",
            "forbidden",
            "invalid api key",
            "authentication",
            "validation",
            "context length",
            "too large",
            "unknown agent",
        ];
        if fatal.iter().any(|needle| lowered.contains(needle)) {
            ErrorClass::Fatal
        } else {
            ErrorClass::Retryable
        }
    })
}

/// Scheduler configuration. See `constants` for the default values.
#[derive(Debug, Clone)]
pub struct BatchManagerConfig {
    /// Ceiling on simultaneously Running batches.
    pub max_batches: usize,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    /// Visibility timeout handed to the built-in local queue.
    pub claim_timeout: Duration,
    /// Period of the queue reclaim scan.
    pub recovery_interval: Duration,
    /// Delay before startup recovery scans the store.
    pub settle_delay: Duration,
    pub default_concurrency: usize,
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
}

impl Default for BatchManagerConfig {
    fn default() -> Self {
        Self {
            max_batches: constants::DEFAULT_MAX_BATCHES,
            poll_interval: Duration::from_millis(constants::DEFAULT_POLL_INTERVAL_MS),
            progress_interval: Duration::from_millis(constants::DEFAULT_PROGRESS_INTERVAL_MS),
            claim_timeout: Duration::from_secs(constants::DEFAULT_CLAIM_TIMEOUT_SECS),
            recovery_interval: Duration::from_secs(constants::DEFAULT_RECOVERY_INTERVAL_SECS),
            settle_delay: Duration::from_secs(constants::DEFAULT_SETTLE_DELAY_SECS),
            default_concurrency: constants::DEFAULT_CONCURRENCY,
            default_timeout_secs: constants::DEFAULT_TASK_TIMEOUT_SECS,
            default_max_retries: constants::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Inputs for batch creation.
#[derive(Debug, Clone)]
pub struct CreateBatchRequest {
    pub name: String,
    pub user_id: String,
    pub agent_ref: String,
    pub prompt_template: String,
    /// One task per input mapping, in order.
    pub inputs: Vec<HashMap<String, String>>,
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub auto_start: bool,
}

/// The batch scheduler.
#[derive(Clone)]
pub struct BatchManager {
    store: Arc<dyn BatchStore>,
    queue: Arc<dyn TaskQueue>,
    sessions: Arc<dyn SessionBackend>,
    events: Arc<EventBus>,
    classifier: ErrorClassifier,
    config: Arc<BatchManagerConfig>,
    running: Arc<RwLock<HashMap<String, Arc<RunningBatch>>>>,
    root: CancellationToken,
}

impl BatchManager {
    /// Creates a manager. A `None` queue selects process-local dispatch.
    pub fn new(
        store: Arc<dyn BatchStore>,
        sessions: Arc<dyn SessionBackend>,
        queue: Option<Arc<dyn TaskQueue>>,
        classifier: Option<ErrorClassifier>,
        config: BatchManagerConfig,
    ) -> Self {
        let queue =
            queue.unwrap_or_else(|| Arc::new(LocalQueue::new(config.claim_timeout)) as Arc<_>);
        Self {
            store,
            queue,
            sessions,
            events: Arc::new(EventBus::new()),
            classifier: classifier.unwrap_or_else(default_classifier),
            config: Arc::new(config),
            running: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub(crate) fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub(crate) fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub(crate) fn sessions(&self) -> &Arc<dyn SessionBackend> {
        &self.sessions
    }

    pub(crate) fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub(crate) fn config(&self) -> &BatchManagerConfig {
        &self.config
    }

    /// Validates the request, persists the batch and its tasks, and puts
    /// the task references on the queue. The store is authoritative: queue
    /// unavailability is logged and recovered from later.
    pub async fn create_batch(&self, req: CreateBatchRequest) -> Result<Batch> {
        if req.inputs.is_empty() {
            return Err(VesselError::Validation(
                "batch inputs must not be empty".to_string(),
            ));
        }
        template::validate(&req.prompt_template)?;
        self.sessions.resolve(&req.agent_ref).await?;

        let template = Template {
            prompt: req.prompt_template,
            timeout_secs: req.timeout_secs.unwrap_or(self.config.default_timeout_secs),
            max_retries: req.max_retries.unwrap_or(self.config.default_max_retries),
        };
        let concurrency = req
            .concurrency
            .unwrap_or(self.config.default_concurrency)
            .max(1);
        let batch = Batch::new(
            req.user_id,
            req.name,
            req.agent_ref,
            template,
            concurrency,
            req.inputs.len() as u64,
        );
        self.store.create_batch(&batch).await?;

        let tasks: Vec<BatchTask> = req
            .inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| BatchTask::new(&batch.id, i as u64, input))
            .collect();
        if let Err(e) = self.store.create_tasks(&tasks).await {
            if let Err(cleanup_err) = self.store.delete_batch(&batch.id).await {
                warn!(
                    "Failed to delete batch {} after task insert error: {}",
                    batch.id, cleanup_err
                );
            }
            return Err(e);
        }

        let refs: Vec<QueueItem> = tasks.iter().map(QueueItem::from_task).collect();
        if let Err(e) = self.queue.enqueue(&batch.id, &refs).await {
            warn!(
                "Queue unavailable while enqueueing batch {}; recovery will re-enqueue: {}",
                batch.id, e
            );
        }

        info!("Created batch {} with {} task(s)", batch.id, batch.total);
        if req.auto_start {
            self.start_batch(&batch.id).await?;
            return self.store.get_batch(&batch.id).await;
        }
        Ok(batch)
    }

    /// Starts a Pending batch, or resumes a Paused one.
    ///
    /// Provisions one session per worker before any fiber is spawned; on a
    /// partial provisioning failure every session created by this call is
    /// stopped and the batch keeps its previous status.
    pub async fn start_batch(&self, batch_id: &str) -> Result<()> {
        {
            let running = self.running.read().await;
            if running.contains_key(batch_id) {
                return Err(VesselError::AlreadyRunning(batch_id.to_string()));
            }
            if running.len() >= self.config.max_batches {
                return Err(VesselError::CapacityExhausted {
                    running: running.len(),
                    max: self.config.max_batches,
                });
            }
        }

        let mut batch = self.store.get_batch(batch_id).await?;
        if !matches!(batch.status, BatchStatus::Pending | BatchStatus::Paused) {
            return Err(VesselError::Validation(format!(
                "batch {} cannot start from status {:?}",
                batch_id, batch.status
            )));
        }
        let resumed = batch.status == BatchStatus::Paused;

        let workers = match self.provision_workers(&batch, resumed).await {
            Ok(workers) => workers,
            Err(e) => {
                warn!("Worker provisioning failed for batch {}: {}", batch_id, e);
                return Err(e);
            }
        };

        let rb = Arc::new(RunningBatch::new(
            &batch,
            workers.clone(),
            self.root.child_token(),
        ));

        {
            let mut running = self.running.write().await;
            if running.contains_key(batch_id) || running.len() >= self.config.max_batches {
                drop(running);
                self.discard_workers(&workers).await;
                return Err(VesselError::AlreadyRunning(batch_id.to_string()));
            }
            running.insert(batch_id.to_string(), rb.clone());
        }

        batch.status = BatchStatus::Running;
        if batch.started_at.is_none() {
            batch.started_at = Some(Utc::now());
        }
        batch.workers = workers.clone();
        if let Err(e) = self.store.update_batch(&batch).await {
            self.running.write().await.remove(batch_id);
            self.discard_workers(&workers).await;
            return Err(e);
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers.len() + 2);
        for info in &workers {
            handles.push(tokio::spawn(worker::run_worker(
                self.clone(),
                rb.clone(),
                info.clone(),
            )));
            self.events
                .publish(BatchEvent::new(
                    batch_id,
                    EventKind::WorkerStarted,
                    &WorkerPayload {
                        worker_id: info.id.clone(),
                        session_id: info.session_id.clone(),
                        error: None,
                    },
                ))
                .await;
        }
        handles.push(tokio::spawn(dispatcher::run_dispatcher(
            self.clone(),
            rb.clone(),
        )));
        handles.push(tokio::spawn(progress::run_reporter(
            self.clone(),
            rb.clone(),
        )));
        *rb.handles.lock().await = handles;

        let kind = if resumed {
            EventKind::BatchResumed
        } else {
            EventKind::BatchStarted
        };
        self.events
            .publish(BatchEvent::new(
                batch_id,
                kind,
                &json!({
                    "name": batch.name,
                    "total": batch.total,
                    "concurrency": batch.concurrency,
                }),
            ))
            .await;
        info!(
            "{} batch {} with {} worker(s)",
            if resumed { "Resumed" } else { "Started" },
            batch_id,
            batch.concurrency
        );
        Ok(())
    }

    /// Resume is equivalent to start; a Paused batch additionally reuses
    /// roster sessions that are still alive.
    pub async fn resume_batch(&self, batch_id: &str) -> Result<()> {
        self.start_batch(batch_id).await
    }

    /// Stops the batch's fibers but keeps its sessions for fast resume.
    pub async fn pause_batch(&self, batch_id: &str) -> Result<()> {
        let rb = self
            .take_running(batch_id)
            .await
            .ok_or_else(|| VesselError::NotRunning(batch_id.to_string()))?;
        self.teardown(&rb, false).await;

        let mut batch = self.store.get_batch(batch_id).await?;
        batch.status = BatchStatus::Paused;
        batch.error_counts = rb.counters.lock().await.error_counts.clone();
        batch.workers = rb.workers_snapshot().await;
        self.store.update_batch(&batch).await?;

        self.events
            .publish(BatchEvent::new(
                batch_id,
                EventKind::BatchPaused,
                &json!({ "completed": batch.completed, "total": batch.total }),
            ))
            .await;
        info!("Paused batch {}", batch_id);
        Ok(())
    }

    /// Full teardown: stops fibers and sessions, resets any still-Running
    /// tasks to Pending, and marks the batch Cancelled.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        let rb = self
            .take_running(batch_id)
            .await
            .ok_or_else(|| VesselError::NotRunning(batch_id.to_string()))?;
        self.teardown(&rb, true).await;

        if let Err(e) = self.store.reset_running_tasks(batch_id).await {
            warn!("Failed to reset running tasks of batch {}: {}", batch_id, e);
        }

        let mut batch = self.store.get_batch(batch_id).await?;
        batch.status = BatchStatus::Cancelled;
        batch.completed_at = Some(Utc::now());
        batch.error_counts = rb.counters.lock().await.error_counts.clone();
        batch.workers.clear();
        self.store.update_batch(&batch).await?;

        self.events
            .publish(BatchEvent::new(
                batch_id,
                EventKind::BatchCancelled,
                &json!({ "completed": batch.completed, "total": batch.total }),
            ))
            .await;
        info!("Cancelled batch {}", batch_id);
        Ok(())
    }

    /// Deletes a non-running batch, cascading to its tasks, queue keys, and
    /// event subscribers.
    pub async fn delete_batch(&self, batch_id: &str) -> Result<()> {
        if self.running.read().await.contains_key(batch_id) {
            return Err(VesselError::AlreadyRunning(batch_id.to_string()));
        }
        self.store.delete_batch(batch_id).await?;
        if let Err(e) = self.queue.cleanup(batch_id).await {
            warn!("Failed to clean queue keys of batch {}: {}", batch_id, e);
        }
        self.events.remove_batch(batch_id).await;
        info!("Deleted batch {}", batch_id);
        Ok(())
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Batch> {
        let mut batch = self.store.get_batch(batch_id).await?;
        if let Some(rb) = self.running.read().await.get(batch_id) {
            batch.workers = rb.workers_snapshot().await;
            batch.error_counts = rb.counters.lock().await.error_counts.clone();
        }
        Ok(batch)
    }

    pub async fn list_batches(&self, filter: &BatchFilter) -> Result<(Vec<Batch>, usize)> {
        self.store.list_batches(filter).await
    }

    pub async fn list_tasks(
        &self,
        batch_id: &str,
        filter: &TaskFilter,
    ) -> Result<(Vec<BatchTask>, usize)> {
        self.store.list_tasks(batch_id, filter).await
    }

    pub async fn list_dead_tasks(&self, batch_id: &str, limit: usize) -> Result<Vec<BatchTask>> {
        self.store.list_dead_tasks(batch_id, limit).await
    }

    pub async fn task_stats(&self, batch_id: &str) -> Result<TaskStats> {
        self.store.task_stats(batch_id).await
    }

    pub async fn queue_stats(&self, batch_id: &str) -> Result<QueueStats> {
        self.queue.stats(batch_id).await
    }

    /// Returns every Failed task of a non-running batch to Pending, clears
    /// their error fields, resets the batch counters, and re-enqueues them.
    pub async fn retry_failed(&self, batch_id: &str) -> Result<usize> {
        if self.running.read().await.contains_key(batch_id) {
            return Err(VesselError::AlreadyRunning(batch_id.to_string()));
        }
        let mut batch = self.store.get_batch(batch_id).await?;

        let (failed_tasks, _) = self
            .store
            .list_tasks(
                batch_id,
                &TaskFilter {
                    status: Some(TaskStatus::Failed),
                    ..TaskFilter::default()
                },
            )
            .await?;

        for task in &failed_tasks {
            let mut reset = task.clone();
            reset.status = TaskStatus::Pending;
            reset.error = None;
            reset.worker_id = None;
            reset.duration_ms = None;
            reset.started_at = None;
            reset.claimed_at = None;
            reset.claimed_by = None;
            self.store.update_task(&reset).await?;
        }

        let refs: Vec<QueueItem> = failed_tasks.iter().map(QueueItem::from_task).collect();
        if let Err(e) = self.queue.enqueue(batch_id, &refs).await {
            warn!("Failed to re-enqueue retried tasks of batch {}: {}", batch_id, e);
        }

        batch.failed = 0;
        batch.status = BatchStatus::Pending;
        batch.error_counts.clear();
        batch.completed_at = None;
        self.store.update_batch(&batch).await?;
        info!(
            "Reset {} failed task(s) of batch {} to pending",
            failed_tasks.len(),
            batch_id
        );
        Ok(failed_tasks.len())
    }

    /// Moves dead tasks of a non-running batch back to Pending with
    /// attempts reset. An empty id list selects every dead task.
    pub async fn retry_dead_tasks(&self, batch_id: &str, ids: &[String]) -> Result<usize> {
        if self.running.read().await.contains_key(batch_id) {
            return Err(VesselError::AlreadyRunning(batch_id.to_string()));
        }
        let mut batch = self.store.get_batch(batch_id).await?;

        let count = self.store.retry_dead_tasks(batch_id, ids).await?;
        if let Err(e) = self.queue.retry_dead(batch_id, ids).await {
            warn!("Queue retry-dead failed for batch {}: {}", batch_id, e);
        }

        batch.dead = batch.dead.saturating_sub(count as u64);
        if batch.status.is_terminal() {
            batch.status = BatchStatus::Pending;
            batch.completed_at = None;
        }
        self.store.update_batch(&batch).await?;
        info!("Retried {} dead task(s) of batch {}", count, batch_id);
        Ok(count)
    }

    /// Startup crash recovery. After a settle delay, every batch persisted
    /// as Running has its Running tasks reset to Pending, its queue index
    /// rebuilt from the store, and its status set to Paused. An operator
    /// resumes explicitly; work is never silently re-run.
    pub async fn recover(&self) -> Result<usize> {
        tokio::time::sleep(self.config.settle_delay).await;
        let batches = self.store.list_running_batches().await?;
        let mut recovered = 0;
        for mut batch in batches {
            match self.recover_one(&mut batch).await {
                Ok(()) => recovered += 1,
                Err(e) => error!("Recovery failed for batch {}: {}", batch.id, e),
            }
        }
        if recovered > 0 {
            info!("Recovered {} interrupted batch(es)", recovered);
        }
        Ok(recovered)
    }

    async fn recover_one(&self, batch: &mut Batch) -> Result<()> {
        let reset = self.store.reset_running_tasks(&batch.id).await?;
        let (pending, _) = self
            .store
            .list_tasks(
                &batch.id,
                &TaskFilter {
                    status: Some(TaskStatus::Pending),
                    ..TaskFilter::default()
                },
            )
            .await?;

        // The store is authoritative: drop whatever queue state survived
        // and rebuild the index, so no reference is duplicated or lost.
        if let Err(e) = self.queue.cleanup(&batch.id).await {
            warn!("Queue cleanup failed for batch {}: {}", batch.id, e);
        }
        let refs: Vec<QueueItem> = pending.iter().map(QueueItem::from_task).collect();
        if let Err(e) = self.queue.enqueue(&batch.id, &refs).await {
            warn!("Queue re-enqueue failed for batch {}: {}", batch.id, e);
        }

        batch.status = BatchStatus::Paused;
        batch.workers.clear();
        self.store.update_batch(batch).await?;
        info!(
            "Recovered batch {}: {} running task(s) reset, {} pending re-enqueued",
            batch.id,
            reset,
            refs.len()
        );
        Ok(())
    }

    /// Spawns the periodic reclaim fiber returning timed-out claims of
    /// running batches to pending. Runs until shutdown.
    pub fn start_reclaim_loop(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            debug!("Queue reclaim loop started");
            loop {
                tokio::select! {
                    _ = manager.root.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.recovery_interval) => {}
                }
                let ids: Vec<String> = manager.running.read().await.keys().cloned().collect();
                for id in ids {
                    match manager.queue.recover_timed_out(&id).await {
                        Ok(0) => {}
                        Ok(n) => info!("Reclaimed {} timed-out task(s) for batch {}", n, id),
                        Err(e) => warn!("Queue reclaim failed for batch {}: {}", id, e),
                    }
                }
            }
            debug!("Queue reclaim loop exited");
        })
    }

    /// Graceful shutdown: cancels the root token and pauses every running
    /// batch, keeping their sessions for the next process.
    pub async fn shutdown(&self) {
        info!("Shutting down batch manager");
        self.root.cancel();
        let ids: Vec<String> = self.running.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.pause_batch(&id).await {
                warn!("Failed to pause batch {} during shutdown: {}", id, e);
            }
        }
    }

    pub async fn subscribe(&self, batch_id: &str) -> (Uuid, mpsc::Receiver<BatchEvent>) {
        self.events.subscribe(batch_id).await
    }

    pub async fn unsubscribe(&self, batch_id: &str, id: Uuid) {
        self.events.unsubscribe(batch_id, id).await
    }

    /// Called by workers after every task terminus. Fires completion at
    /// most once per batch, off the worker path.
    pub(crate) async fn check_completion(&self, rb: &Arc<RunningBatch>) {
        let stats = match self.store.task_stats(&rb.batch_id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to read stats for batch {}: {}", rb.batch_id, e);
                return;
            }
        };
        if stats.completed + stats.failed + stats.dead < rb.total {
            return;
        }
        let fire = {
            let mut counters = rb.counters.lock().await;
            if counters.completing {
                false
            } else {
                counters.completing = true;
                true
            }
        };
        if fire {
            let manager = self.clone();
            let batch_id = rb.batch_id.clone();
            tokio::spawn(async move { manager.finish_batch(batch_id).await });
        }
    }

    /// Persists batch counters every few completions so listings stay
    /// roughly current without a write per task.
    pub(crate) async fn maybe_persist_counters(&self, rb: &Arc<RunningBatch>) {
        let error_counts = {
            let mut counters = rb.counters.lock().await;
            if counters.since_persist < constants::COUNTER_PERSIST_INTERVAL {
                return;
            }
            counters.since_persist = 0;
            counters.error_counts.clone()
        };
        match self.store.get_batch(&rb.batch_id).await {
            Ok(mut batch) => {
                batch.error_counts = error_counts;
                batch.workers = rb.workers_snapshot().await;
                if let Err(e) = self.store.update_batch(&batch).await {
                    warn!(
                        "Deferred counter persist failed for batch {} (will retry later): {}",
                        rb.batch_id, e
                    );
                }
            }
            Err(e) => warn!("Failed to load batch {} for persist: {}", rb.batch_id, e),
        }
    }

    async fn finish_batch(&self, batch_id: String) {
        let Some(rb) = self.take_running(&batch_id).await else {
            return;
        };
        self.teardown(&rb, true).await;

        let stats = match self.store.task_stats(&batch_id).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Failed to read final stats for batch {}: {}", batch_id, e);
                return;
            }
        };
        let mut batch = match self.store.get_batch(&batch_id).await {
            Ok(batch) => batch,
            Err(e) => {
                error!("Failed to load batch {} for completion: {}", batch_id, e);
                return;
            }
        };

        batch.completed = stats.completed;
        batch.failed = stats.failed;
        batch.dead = stats.dead;
        // The live histogram counts every attempt's error; the stats
        // histogram only sees final task errors.
        batch.error_counts = rb.counters.lock().await.error_counts.clone();
        // Partial success is success at batch level: only a batch with
        // terminal failures and zero completions is Failed.
        batch.status = if stats.completed == 0 && stats.failed + stats.dead > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        batch.completed_at = Some(Utc::now());
        batch.workers.clear();
        if let Err(e) = self.store.update_batch(&batch).await {
            error!("Failed to persist completion of batch {}: {}", batch_id, e);
        }

        let kind = if batch.status == BatchStatus::Failed {
            EventKind::BatchFailed
        } else {
            EventKind::BatchCompleted
        };
        self.events
            .publish(BatchEvent::new(
                &batch_id,
                kind,
                &json!({
                    "completed": stats.completed,
                    "failed": stats.failed,
                    "dead": stats.dead,
                    "total": batch.total,
                }),
            ))
            .await;
        info!(
            "Batch {} finished as {:?} ({} completed, {} failed, {} dead)",
            batch_id, batch.status, stats.completed, stats.failed, stats.dead
        );
    }

    async fn take_running(&self, batch_id: &str) -> Option<Arc<RunningBatch>> {
        let mut running = self.running.write().await;
        running.remove(batch_id)
    }

    /// Cancels the batch's fibers, joins them, and requeues every claimed
    /// task that never reached a terminus. Stops sessions only on full
    /// teardown (cancel/complete); pause keeps them.
    async fn teardown(&self, rb: &Arc<RunningBatch>, stop_sessions: bool) {
        rb.cancel.cancel();
        {
            let mut handles = rb.handles.lock().await;
            for handle in handles.drain(..) {
                if let Err(e) = handle.await {
                    warn!("Batch {} fiber panicked: {}", rb.batch_id, e);
                }
            }
        }

        self.requeue_undelivered(rb).await;
        self.requeue_in_flight(rb).await;

        for info in rb.workers_snapshot().await {
            if stop_sessions {
                if let Err(e) = self.sessions.stop_session(&info.session_id).await {
                    warn!("Failed to stop session {}: {}", info.session_id, e);
                    self.events
                        .publish(BatchEvent::new(
                            &rb.batch_id,
                            EventKind::WorkerError,
                            &WorkerPayload {
                                worker_id: info.id.clone(),
                                session_id: info.session_id.clone(),
                                error: Some(e.to_string()),
                            },
                        ))
                        .await;
                }
            }
            self.events
                .publish(BatchEvent::new(
                    &rb.batch_id,
                    EventKind::WorkerStopped,
                    &WorkerPayload {
                        worker_id: info.id,
                        session_id: info.session_id,
                        error: None,
                    },
                ))
                .await;
        }
    }

    /// Returns tasks the dispatcher claimed but no worker picked up.
    async fn requeue_undelivered(&self, rb: &Arc<RunningBatch>) {
        let mut rx = rb.tasks_rx.lock().await;
        while let Ok(task) = rx.try_recv() {
            if let Err(e) = self.store.requeue_task(&task).await {
                warn!("Failed to requeue undelivered task {}: {}", task.id, e);
            }
            if let Err(e) = self
                .queue
                .requeue(&rb.batch_id, &task.id, task.attempts)
                .await
            {
                warn!("Queue requeue failed for task {}: {}", task.id, e);
            }
        }
    }

    /// Returns tasks abandoned mid-execution by cancelled workers. Those
    /// workers never persist a terminus, so the roster's current-task
    /// markers identify them.
    async fn requeue_in_flight(&self, rb: &Arc<RunningBatch>) {
        for info in rb.workers_snapshot().await {
            let Some(task_id) = info.current_task else {
                continue;
            };
            match self.store.get_task(&task_id).await {
                Ok(task) if task.status == TaskStatus::Running => {
                    if let Err(e) = self.store.requeue_task(&task).await {
                        warn!("Failed to requeue in-flight task {}: {}", task_id, e);
                    }
                    if let Err(e) = self
                        .queue
                        .requeue(&rb.batch_id, &task_id, task.attempts)
                        .await
                    {
                        warn!("Queue requeue failed for task {}: {}", task_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to load in-flight task {}: {}", task_id, e),
            }
        }
    }

    /// Creates one session per worker slot. On resume, roster sessions
    /// still reporting Active are reattached instead of recreated. If any
    /// slot fails, every session acquired by this call is released and the
    /// error surfaces.
    async fn provision_workers(&self, batch: &Batch, resumed: bool) -> Result<Vec<WorkerInfo>> {
        let mut workers: Vec<WorkerInfo> = Vec::with_capacity(batch.concurrency);
        for slot in 0..batch.concurrency {
            let reused = if resumed {
                match batch.workers.get(slot) {
                    Some(previous) => self
                        .sessions
                        .get_session(&previous.session_id)
                        .await
                        .filter(|s| s.state == SessionState::Active),
                    None => None,
                }
            } else {
                None
            };

            let session_id = match reused {
                Some(session) => {
                    debug!(
                        "Reusing session {} for batch {} worker slot {}",
                        session.id, batch.id, slot
                    );
                    session.id
                }
                None => match self.sessions.create_session(&batch.agent_ref).await {
                    Ok(session) => session.id,
                    Err(e) => {
                        self.discard_workers(&workers).await;
                        self.events
                            .publish(BatchEvent::new(
                                &batch.id,
                                EventKind::WorkerError,
                                &WorkerPayload {
                                    worker_id: format!("slot-{slot}"),
                                    session_id: String::new(),
                                    error: Some(e.to_string()),
                                },
                            ))
                            .await;
                        return Err(e);
                    }
                },
            };

            workers.push(WorkerInfo {
                id: new_worker_id(),
                session_id,
                busy: false,
                current_task: None,
                started_at: Utc::now(),
            });
        }
        Ok(workers)
    }

    async fn discard_workers(&self, workers: &[WorkerInfo]) {
        for info in workers {
            if let Err(e) = self.sessions.stop_session(&info.session_id).await {
                warn!("Failed to stop session {}: {}", info.session_id, e);
            }
        }
    }
}

fn new_worker_id() -> String {
    format!("worker-{}", &Uuid::new_v4().to_string()[..8])
}
