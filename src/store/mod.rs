//! Durable persistence interface for batches and tasks.
//!
//! The relational store implementation lives outside this crate; the
//! scheduler depends only on the [`BatchStore`] capability. [`MemoryStore`]
//! is the in-process implementation used for tests and single-node runs.
//! Every mutation is observable before the call returns, and concurrent
//! counter updates compose.

use crate::models::{
    error_key, Batch, BatchFilter, BatchStatus, BatchTask, TaskFilter, TaskStats, TaskStatus,
};
use crate::{Result, VesselError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Transactional persistence of batches and tasks.
///
/// Each operation is a single logical transaction. Implementations must
/// make `update_counters` commutative under concurrency and `create_tasks`
/// all-or-nothing.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create_batch(&self, batch: &Batch) -> Result<()>;

    async fn get_batch(&self, id: &str) -> Result<Batch>;

    async fn update_batch(&self, batch: &Batch) -> Result<()>;

    /// Deletes a batch and cascades to all of its tasks.
    async fn delete_batch(&self, id: &str) -> Result<()>;

    async fn list_batches(&self, filter: &BatchFilter) -> Result<(Vec<Batch>, usize)>;

    /// Bulk-inserts tasks atomically: either every task is persisted or
    /// none are.
    async fn create_tasks(&self, tasks: &[BatchTask]) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<BatchTask>;

    async fn update_task(&self, task: &BatchTask) -> Result<()>;

    async fn list_tasks(
        &self,
        batch_id: &str,
        filter: &TaskFilter,
    ) -> Result<(Vec<BatchTask>, usize)>;

    async fn delete_tasks(&self, batch_id: &str) -> Result<()>;

    /// Returns a task to Pending and clears its worker, claim, and start
    /// fields. The attempt count is retained.
    async fn requeue_task(&self, task: &BatchTask) -> Result<()>;

    /// Moves a task to Dead with the given reason.
    async fn mark_task_dead(&self, task: &BatchTask, reason: &str) -> Result<()>;

    async fn list_dead_tasks(&self, batch_id: &str, limit: usize) -> Result<Vec<BatchTask>>;

    /// Transitions the given Dead tasks back to Pending with attempts reset
    /// to zero. An empty id list selects every dead task of the batch.
    /// Returns the number of tasks transitioned.
    async fn retry_dead_tasks(&self, batch_id: &str, ids: &[String]) -> Result<usize>;

    /// Transitions every Running task of the batch back to Pending. Used by
    /// startup crash recovery. Returns the number of tasks reset.
    async fn reset_running_tasks(&self, batch_id: &str) -> Result<usize>;

    /// All batches whose persisted status is Running.
    async fn list_running_batches(&self) -> Result<Vec<Batch>>;

    /// Atomically adds deltas to the batch counters. Concurrent calls
    /// compose; counters never go below zero.
    async fn update_counters(
        &self,
        batch_id: &str,
        d_completed: i64,
        d_failed: i64,
        d_dead: i64,
    ) -> Result<()>;

    /// Aggregates per-status counts, mean completed duration, and the
    /// error histogram over the batch's tasks.
    async fn task_stats(&self, batch_id: &str) -> Result<TaskStats>;
}

#[derive(Default)]
struct Inner {
    batches: HashMap<String, Batch>,
    tasks: HashMap<String, BatchTask>,
}

/// In-memory store. A single writer lock makes each operation one logical
/// transaction.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

fn add_clamped(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.batches.contains_key(&batch.id) {
            return Err(VesselError::AlreadyExists(format!("batch {}", batch.id)));
        }
        inner.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Batch> {
        let inner = self.inner.read().await;
        inner
            .batches
            .get(id)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(format!("batch {id}")))
    }

    async fn update_batch(&self, batch: &Batch) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.batches.contains_key(&batch.id) {
            return Err(VesselError::NotFound(format!("batch {}", batch.id)));
        }
        inner.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.batches.remove(id).is_none() {
            return Err(VesselError::NotFound(format!("batch {id}")));
        }
        inner.tasks.retain(|_, t| t.batch_id != id);
        Ok(())
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<(Vec<Batch>, usize)> {
        let inner = self.inner.read().await;
        let mut items: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| {
                filter
                    .user_id
                    .as_ref()
                    .map(|u| &b.user_id == u)
                    .unwrap_or(true)
                    && filter.status.map(|s| b.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = items.len();
        let items = paginate(items, filter.offset, filter.limit);
        Ok((items, total))
    }

    async fn create_tasks(&self, tasks: &[BatchTask]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = tasks.iter().find(|t| inner.tasks.contains_key(&t.id)) {
            return Err(VesselError::AlreadyExists(format!("task {}", existing.id)));
        }
        for task in tasks {
            inner.tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<BatchTask> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, task: &BatchTask) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&task.id) {
            return Err(VesselError::NotFound(format!("task {}", task.id)));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list_tasks(
        &self,
        batch_id: &str,
        filter: &TaskFilter,
    ) -> Result<(Vec<BatchTask>, usize)> {
        let inner = self.inner.read().await;
        let mut items: Vec<BatchTask> = inner
            .tasks
            .values()
            .filter(|t| {
                t.batch_id == batch_id && filter.status.map(|s| t.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        items.sort_by_key(|t| t.index);

        let total = items.len();
        let items = paginate(items, filter.offset, filter.limit);
        Ok((items, total))
    }

    async fn delete_tasks(&self, batch_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.tasks.retain(|_, t| t.batch_id != batch_id);
        Ok(())
    }

    async fn requeue_task(&self, task: &BatchTask) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| VesselError::NotFound(format!("task {}", task.id)))?;
        stored.status = TaskStatus::Pending;
        stored.worker_id = None;
        stored.claimed_at = None;
        stored.claimed_by = None;
        stored.started_at = None;
        stored.attempts = task.attempts;
        stored.error = task.error.clone();
        debug!("Requeued task {} (attempts: {})", task.id, task.attempts);
        Ok(())
    }

    async fn mark_task_dead(&self, task: &BatchTask, reason: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| VesselError::NotFound(format!("task {}", task.id)))?;
        stored.status = TaskStatus::Dead;
        stored.dead_at = Some(Utc::now());
        stored.dead_reason = Some(reason.to_string());
        stored.attempts = task.attempts;
        stored.error = task.error.clone();
        stored.duration_ms = task.duration_ms;
        stored.worker_id = None;
        Ok(())
    }

    async fn list_dead_tasks(&self, batch_id: &str, limit: usize) -> Result<Vec<BatchTask>> {
        let inner = self.inner.read().await;
        let mut items: Vec<BatchTask> = inner
            .tasks
            .values()
            .filter(|t| t.batch_id == batch_id && t.status == TaskStatus::Dead)
            .cloned()
            .collect();
        items.sort_by_key(|t| t.dead_at);
        if limit > 0 {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn retry_dead_tasks(&self, batch_id: &str, ids: &[String]) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for task in inner.tasks.values_mut() {
            if task.batch_id != batch_id || task.status != TaskStatus::Dead {
                continue;
            }
            if !ids.is_empty() && !ids.contains(&task.id) {
                continue;
            }
            task.status = TaskStatus::Pending;
            task.attempts = 0;
            task.dead_at = None;
            task.dead_reason = None;
            task.error = None;
            task.worker_id = None;
            task.claimed_at = None;
            task.claimed_by = None;
            task.started_at = None;
            task.duration_ms = None;
            count += 1;
        }
        Ok(count)
    }

    async fn reset_running_tasks(&self, batch_id: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for task in inner.tasks.values_mut() {
            if task.batch_id == batch_id && task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.claimed_at = None;
                task.claimed_by = None;
                task.started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_running_batches(&self) -> Result<Vec<Batch>> {
        let inner = self.inner.read().await;
        Ok(inner
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Running)
            .cloned()
            .collect())
    }

    async fn update_counters(
        &self,
        batch_id: &str,
        d_completed: i64,
        d_failed: i64,
        d_dead: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| VesselError::NotFound(format!("batch {batch_id}")))?;
        batch.completed = add_clamped(batch.completed, d_completed);
        batch.failed = add_clamped(batch.failed, d_failed);
        batch.dead = add_clamped(batch.dead, d_dead);
        Ok(())
    }

    async fn task_stats(&self, batch_id: &str) -> Result<TaskStats> {
        let inner = self.inner.read().await;
        let mut stats = TaskStats::default();
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;

        for task in inner.tasks.values() {
            if task.batch_id != batch_id {
                continue;
            }
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(d) = task.duration_ms {
                        duration_sum += d;
                        duration_count += 1;
                    }
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Dead => stats.dead += 1,
            }
            if task.status == TaskStatus::Failed || task.status == TaskStatus::Dead {
                if let Some(error) = &task.error {
                    *stats.error_counts.entry(error_key(error)).or_insert(0) += 1;
                }
            }
        }

        if duration_count > 0 {
            stats.avg_duration_ms = duration_sum as f64 / duration_count as f64;
        }
        Ok(stats)
    }
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    let mut iter = items.into_iter().skip(offset);
    if limit > 0 {
        iter.by_ref().take(limit).collect()
    } else {
        iter.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Template;
    use std::sync::Arc;

    fn sample_batch(id: &str) -> Batch {
        let mut batch = Batch::new(
            "user1".to_string(),
            "demo".to_string(),
            "claude".to_string(),
            Template {
                prompt: "Say {{.x}}".to_string(),
                timeout_secs: 300,
                max_retries: 0,
            },
            2,
            2,
        );
        batch.id = id.to_string();
        batch
    }

    fn sample_tasks(batch_id: &str, count: u64) -> Vec<BatchTask> {
        (0..count)
            .map(|i| {
                let mut input = HashMap::new();
                input.insert("x".to_string(), format!("value-{i}"));
                BatchTask::new(batch_id, i, input)
            })
            .collect()
    }

    async fn seeded_store(batch_id: &str, tasks: u64) -> MemoryStore {
        let store = MemoryStore::new();
        store.create_batch(&sample_batch(batch_id)).await.unwrap();
        store
            .create_tasks(&sample_tasks(batch_id, tasks))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_batch_crud() {
        let store = MemoryStore::new();
        let batch = sample_batch("batch-00000001");
        store.create_batch(&batch).await.unwrap();

        assert!(matches!(
            store.create_batch(&batch).await,
            Err(VesselError::AlreadyExists(_))
        ));

        let mut fetched = store.get_batch("batch-00000001").await.unwrap();
        fetched.status = BatchStatus::Running;
        store.update_batch(&fetched).await.unwrap();
        assert_eq!(
            store.get_batch("batch-00000001").await.unwrap().status,
            BatchStatus::Running
        );

        store.delete_batch("batch-00000001").await.unwrap();
        assert!(matches!(
            store.get_batch("batch-00000001").await,
            Err(VesselError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_batch_cascades_to_tasks() {
        let store = seeded_store("batch-00000001", 2).await;
        store.delete_batch("batch-00000001").await.unwrap();
        let (tasks, total) = store
            .list_tasks("batch-00000001", &TaskFilter::default())
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_create_tasks_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.create_batch(&sample_batch("batch-0000000a")).await.unwrap();
        let tasks = sample_tasks("batch-0000000a", 2);
        store.create_tasks(&tasks[..1]).await.unwrap();

        // Second bulk insert collides on task 0 and must not insert task 1.
        assert!(store.create_tasks(&tasks).await.is_err());
        assert!(store.get_task("batch-0000000a-1").await.is_err());
    }

    #[tokio::test]
    async fn test_list_tasks_is_index_ordered_and_filtered() {
        let store = seeded_store("batch-0000000b", 5).await;

        let mut task = store.get_task("batch-0000000b-3").await.unwrap();
        task.status = TaskStatus::Completed;
        store.update_task(&task).await.unwrap();

        let (all, total) = store
            .list_tasks("batch-0000000b", &TaskFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 5);
        let indexes: Vec<u64> = all.iter().map(|t| t.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);

        let (pending, pending_total) = store
            .list_tasks(
                "batch-0000000b",
                &TaskFilter {
                    status: Some(TaskStatus::Pending),
                    ..TaskFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pending_total, 4);
        assert!(pending.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_requeue_clears_claim_fields() {
        let store = seeded_store("batch-0000000c", 1).await;
        let mut task = store.get_task("batch-0000000c-0").await.unwrap();
        task.status = TaskStatus::Running;
        task.worker_id = Some("w1".to_string());
        task.claimed_at = Some(Utc::now());
        task.claimed_by = Some("w1".to_string());
        task.started_at = Some(Utc::now());
        task.attempts = 1;
        store.update_task(&task).await.unwrap();

        store.requeue_task(&task).await.unwrap();
        let requeued = store.get_task("batch-0000000c-0").await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.claimed_at.is_none());
        assert!(requeued.started_at.is_none());
        assert_eq!(requeued.attempts, 1);
    }

    #[tokio::test]
    async fn test_mark_dead_and_retry_dead() {
        let store = seeded_store("batch-0000000d", 2).await;
        let mut task = store.get_task("batch-0000000d-0").await.unwrap();
        task.attempts = 3;
        task.error = Some("boom".to_string());
        store
            .mark_task_dead(&task, "max_retries_exceeded: boom")
            .await
            .unwrap();

        let dead = store.list_dead_tasks("batch-0000000d", 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].dead_at.is_some());
        assert_eq!(
            dead[0].dead_reason.as_deref(),
            Some("max_retries_exceeded: boom")
        );

        let count = store.retry_dead_tasks("batch-0000000d", &[]).await.unwrap();
        assert_eq!(count, 1);
        let retried = store.get_task("batch-0000000d-0").await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(retried.dead_at.is_none());

        // No dead tasks left: retry is a no-op.
        let count = store.retry_dead_tasks("batch-0000000d", &[]).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_reset_running_tasks() {
        let store = seeded_store("batch-0000000e", 3).await;
        for i in 0..2 {
            let mut task = store.get_task(&format!("batch-0000000e-{i}")).await.unwrap();
            task.status = TaskStatus::Running;
            task.worker_id = Some("w1".to_string());
            store.update_task(&task).await.unwrap();
        }

        let reset = store.reset_running_tasks("batch-0000000e").await.unwrap();
        assert_eq!(reset, 2);
        let (pending, _) = store
            .list_tasks(
                "batch-0000000e",
                &TaskFilter {
                    status: Some(TaskStatus::Pending),
                    ..TaskFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_counter_updates_compose() {
        let store = Arc::new(seeded_store("batch-0000000f", 2).await);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_counters("batch-0000000f", 1, 0, 0)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let batch = store.get_batch("batch-0000000f").await.unwrap();
        assert_eq!(batch.completed, 20);
    }

    #[tokio::test]
    async fn test_task_stats_aggregates() {
        let store = seeded_store("batch-00000010", 4).await;

        let mut t0 = store.get_task("batch-00000010-0").await.unwrap();
        t0.status = TaskStatus::Completed;
        t0.duration_ms = Some(100);
        store.update_task(&t0).await.unwrap();

        let mut t1 = store.get_task("batch-00000010-1").await.unwrap();
        t1.status = TaskStatus::Completed;
        t1.duration_ms = Some(300);
        store.update_task(&t1).await.unwrap();

        let mut t2 = store.get_task("batch-00000010-2").await.unwrap();
        t2.attempts = 1;
        t2.error = Some("agent exploded".to_string());
        store.mark_task_dead(&t2, "max_retries_exceeded: agent exploded").await.unwrap();

        let stats = store.task_stats("batch-00000010").await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.avg_duration_ms, 200.0);
        assert_eq!(stats.error_counts.get("agent exploded"), Some(&1));
    }

    #[tokio::test]
    async fn test_list_batches_filters_by_status() {
        let store = MemoryStore::new();
        let mut a = sample_batch("batch-000000aa");
        a.status = BatchStatus::Running;
        let b = sample_batch("batch-000000bb");
        store.create_batch(&a).await.unwrap();
        store.create_batch(&b).await.unwrap();

        let running = store.list_running_batches().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "batch-000000aa");

        let (pending, total) = store
            .list_batches(&BatchFilter {
                status: Some(BatchStatus::Pending),
                ..BatchFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(pending[0].id, "batch-000000bb");
    }
}
