//! Task distribution queue.
//!
//! The queue hands each task reference to at most one concurrent executor.
//! It is a distribution index over the store, not the source of truth: lost
//! queue state is rebuilt by the manager's recovery path from Pending tasks.
//!
//! Per batch, every queued reference moves through three keys:
//! `pending` (FIFO), `processing` (scored by claim time), and `dead`.
//! Claimed items whose claim age exceeds the visibility timeout are
//! reclaimable back to pending; this is the mechanism that makes crashed
//! workers' tasks reappear.

mod local;
mod redis;

pub use local::LocalQueue;
pub use redis::RedisQueue;

use crate::models::QueueItem;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Per-batch queue depth counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub dead: u64,
}

/// At-most-one-claim task distribution with visibility timeout, retry, and
/// dead-letter.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Appends task references to the batch's pending sequence in order.
    async fn enqueue(&self, batch_id: &str, items: &[QueueItem]) -> Result<()>;

    /// Atomically moves up to `limit` items from pending to processing,
    /// recording the claim for `worker_id`. Concurrent claimers never
    /// receive the same item.
    async fn claim(&self, batch_id: &str, worker_id: &str, limit: usize)
        -> Result<Vec<QueueItem>>;

    /// Removes a task from processing. Idempotent: completing an item that
    /// is no longer processing is a no-op.
    async fn complete(&self, batch_id: &str, task_id: &str) -> Result<()>;

    /// Moves a task from processing back to the pending tail with an
    /// updated attempt count.
    async fn requeue(&self, batch_id: &str, task_id: &str, attempts: u32) -> Result<()>;

    /// Moves a task to the dead sequence. Inserts into dead even when the
    /// item is absent from processing (late-arriving failure signal).
    async fn move_to_dead(
        &self,
        batch_id: &str,
        task_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<()>;

    /// Returns processing items older than the visibility timeout to
    /// pending, oldest first, preserving attempt counts and clearing claim
    /// records. Returns the number of items reclaimed.
    async fn recover_timed_out(&self, batch_id: &str) -> Result<usize>;

    /// Dead items in insertion order. A `limit` of zero means unbounded.
    async fn list_dead(&self, batch_id: &str, limit: usize) -> Result<Vec<QueueItem>>;

    /// Moves dead items back to pending with attempts reset to zero. An
    /// empty id list selects all dead items. Returns the number moved.
    async fn retry_dead(&self, batch_id: &str, ids: &[String]) -> Result<usize>;

    async fn stats(&self, batch_id: &str) -> Result<QueueStats>;

    /// Removes every key belonging to the batch.
    async fn cleanup(&self, batch_id: &str) -> Result<()>;
}
