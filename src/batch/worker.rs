//! Worker fiber: drains tasks from the batch channel and executes them
//! through the session backend, applying the retry ladder on failure.

use super::state::RunningBatch;
use super::{BatchManager, ErrorClass};
use crate::container::AgentOutput;
use crate::events::{BatchEvent, EventKind, TaskCompletedPayload, TaskFailedPayload, TaskStartedPayload};
use crate::models::{error_key, BatchTask, TaskStatus, WorkerInfo};
use crate::template;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum Outcome {
    Success(AgentOutput),
    Error(String),
    /// The batch was cancelled mid-execution. Nothing is persisted; the
    /// task stays Running in the store until teardown or the queue's
    /// visibility timeout returns it.
    Abandoned,
}

pub(crate) async fn run_worker(manager: BatchManager, rb: Arc<RunningBatch>, info: WorkerInfo) {
    debug!("Worker {} started for batch {}", info.id, rb.batch_id);
    loop {
        let task = {
            let mut rx = rb.tasks_rx.lock().await;
            tokio::select! {
                _ = rb.cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else {
            break;
        };
        run_task(&manager, &rb, &info, task).await;
    }
    debug!("Worker {} exited for batch {}", info.id, rb.batch_id);
}

async fn run_task(
    manager: &BatchManager,
    rb: &Arc<RunningBatch>,
    info: &WorkerInfo,
    mut task: BatchTask,
) {
    let started = Instant::now();
    let now = Utc::now();
    task.status = TaskStatus::Running;
    task.started_at = Some(now);
    task.worker_id = Some(info.id.clone());
    task.claimed_at = Some(now);
    task.claimed_by = Some(info.id.clone());
    if let Err(e) = manager.store().update_task(&task).await {
        warn!("Failed to persist start of task {}: {}", task.id, e);
    }
    rb.set_worker_busy(&info.id, &task.id).await;

    manager
        .events()
        .publish(BatchEvent::new(
            &rb.batch_id,
            EventKind::TaskStarted,
            &TaskStartedPayload {
                task_id: task.id.clone(),
                task_index: task.index,
                worker_id: info.id.clone(),
            },
        ))
        .await;

    match execute(manager, rb, info, &mut task).await {
        // Abandonment keeps the worker's current-task marker set so
        // teardown can requeue the task.
        Outcome::Abandoned => return,
        Outcome::Success(output) => handle_success(manager, rb, info, &mut task, output, started).await,
        Outcome::Error(error) => handle_failure(manager, rb, info, &mut task, error, started).await,
    }

    rb.set_worker_idle(&info.id).await;
    manager.check_completion(rb).await;
}

async fn execute(
    manager: &BatchManager,
    rb: &Arc<RunningBatch>,
    info: &WorkerInfo,
    task: &mut BatchTask,
) -> Outcome {
    let prompt = match template::render(&rb.template.prompt, &task.input) {
        Ok(prompt) => {
            task.prompt = Some(prompt.clone());
            prompt
        }
        Err(e) => return Outcome::Error(e.to_string()),
    };

    let deadline = Duration::from_secs(rb.template.timeout_secs);
    tokio::select! {
        _ = rb.cancel.cancelled() => Outcome::Abandoned,
        result = tokio::time::timeout(
            deadline,
            manager.sessions().execute(&info.session_id, &prompt),
        ) => match result {
            Ok(Ok(output)) if !output.is_error => Outcome::Success(output),
            Ok(Ok(output)) => Outcome::Error(format!("agent error: {}", output.result)),
            Ok(Err(e)) => Outcome::Error(e.to_string()),
            Err(_) => Outcome::Error(format!(
                "execution timed out after {}s",
                rb.template.timeout_secs
            )),
        },
    }
}

async fn handle_success(
    manager: &BatchManager,
    rb: &Arc<RunningBatch>,
    info: &WorkerInfo,
    task: &mut BatchTask,
    output: AgentOutput,
    started: Instant,
) {
    let duration_ms = started.elapsed().as_millis() as u64;
    task.status = TaskStatus::Completed;
    task.result = Some(output.result);
    task.error = None;
    task.duration_ms = Some(duration_ms);

    if let Err(e) = manager.store().update_task(task).await {
        warn!("Failed to persist completion of task {}: {}", task.id, e);
    }
    if let Err(e) = manager.queue().complete(&rb.batch_id, &task.id).await {
        warn!("Queue complete failed for task {}: {}", task.id, e);
    }
    if let Err(e) = manager.store().update_counters(&rb.batch_id, 1, 0, 0).await {
        warn!("Counter update failed for batch {}: {}", rb.batch_id, e);
    }
    {
        let mut counters = rb.counters.lock().await;
        counters.record_completion(Utc::now());
    }
    manager.maybe_persist_counters(rb).await;

    manager
        .events()
        .publish(BatchEvent::new(
            &rb.batch_id,
            EventKind::TaskCompleted,
            &TaskCompletedPayload {
                task_id: task.id.clone(),
                task_index: task.index,
                worker_id: info.id.clone(),
                duration_ms,
            },
        ))
        .await;
    debug!("Task {} completed in {}ms", task.id, duration_ms);
}

async fn handle_failure(
    manager: &BatchManager,
    rb: &Arc<RunningBatch>,
    info: &WorkerInfo,
    task: &mut BatchTask,
    error: String,
    started: Instant,
) {
    let duration_ms = started.elapsed().as_millis() as u64;
    task.error = Some(error.clone());
    task.duration_ms = Some(duration_ms);
    task.attempts += 1;

    let class = (manager.classifier())(&error);
    let retry = class == ErrorClass::Retryable && task.attempts <= rb.template.max_retries;

    if retry {
        {
            let mut counters = rb.counters.lock().await;
            counters.record_retry(error_key(&error));
        }
        if let Err(e) = manager.store().requeue_task(task).await {
            warn!("Failed to requeue task {}: {}", task.id, e);
        }
        if let Err(e) = manager
            .queue()
            .requeue(&rb.batch_id, &task.id, task.attempts)
            .await
        {
            warn!("Queue requeue failed for task {}: {}", task.id, e);
        }
        manager
            .events()
            .publish(BatchEvent::new(
                &rb.batch_id,
                EventKind::TaskFailed,
                &TaskFailedPayload {
                    task_id: task.id.clone(),
                    task_index: task.index,
                    worker_id: info.id.clone(),
                    duration_ms,
                    error: error.clone(),
                },
            ))
            .await;
        debug!(
            "Task {} failed (attempt {} of {}), requeued: {}",
            task.id,
            task.attempts,
            rb.template.max_retries + 1,
            error
        );
        return;
    }

    let reason = match class {
        ErrorClass::Fatal | ErrorClass::Fallover => format!("fatal: {error}"),
        ErrorClass::Retryable => format!("max_retries_exceeded: {error}"),
    };
    if let Err(e) = manager.store().mark_task_dead(task, &reason).await {
        warn!("Failed to mark task {} dead: {}", task.id, e);
    }
    if let Err(e) = manager
        .queue()
        .move_to_dead(&rb.batch_id, &task.id, task.attempts, &error)
        .await
    {
        warn!("Queue move-to-dead failed for task {}: {}", task.id, e);
    }
    if let Err(e) = manager.store().update_counters(&rb.batch_id, 0, 0, 1).await {
        warn!("Counter update failed for batch {}: {}", rb.batch_id, e);
    }
    {
        let mut counters = rb.counters.lock().await;
        counters.record_dead(error_key(&error));
    }
    manager.maybe_persist_counters(rb).await;

    manager
        .events()
        .publish(BatchEvent::new(
            &rb.batch_id,
            EventKind::TaskFailed,
            &TaskFailedPayload {
                task_id: task.id.clone(),
                task_index: task.index,
                worker_id: info.id.clone(),
                duration_ms,
                error: format!("DEAD: {error}"),
            },
        ))
        .await;
    warn!(
        "Task {} dead after {} attempt(s): {}",
        task.id, task.attempts, reason
    );
}
