//! Redis-backed distributed queue implementation.
//!
//! Per batch, four namespaced keys hold the queue state: `pending` (LIST,
//! FIFO), `processing` (ZSET scored by claim epoch-seconds), `dead` (LIST),
//! and `claims` (HASH task id -> worker id, best-effort bookkeeping).
//! Every transition that touches more than one key runs as a single
//! server-side Lua script, so concurrent claimers across processes never
//! double-issue an item.

use super::{QueueStats, TaskQueue};
use crate::models::QueueItem;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, warn};

/// Pops up to `limit` items from pending and scores them into processing.
const CLAIM_SCRIPT: &str = r#"
local out = {}
for i = 1, tonumber(ARGV[2]) do
    local payload = redis.call('LPOP', KEYS[1])
    if not payload then break end
    redis.call('ZADD', KEYS[2], tonumber(ARGV[1]), payload)
    out[#out + 1] = payload
end
return out
"#;

/// Removes one task's payload from processing and drops its claim record.
const COMPLETE_SCRIPT: &str = r#"
local entries = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, payload in ipairs(entries) do
    local item = cjson.decode(payload)
    if item.task_id == ARGV[1] then
        redis.call('ZREM', KEYS[1], payload)
        break
    end
end
return redis.call('HDEL', KEYS[2], ARGV[1])
"#;

/// Moves one task from processing to the pending tail with a replacement
/// payload carrying the updated attempt count.
const REQUEUE_SCRIPT: &str = r#"
local entries = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, payload in ipairs(entries) do
    local item = cjson.decode(payload)
    if item.task_id == ARGV[1] then
        redis.call('ZREM', KEYS[1], payload)
        break
    end
end
redis.call('RPUSH', KEYS[2], ARGV[2])
return redis.call('HDEL', KEYS[3], ARGV[1])
"#;

/// Moves one task to dead. The dead entry is inserted even when the task
/// was not in processing.
const MOVE_DEAD_SCRIPT: &str = r#"
local entries = redis.call('ZRANGE', KEYS[1], 0, -1)
for _, payload in ipairs(entries) do
    local item = cjson.decode(payload)
    if item.task_id == ARGV[1] then
        redis.call('ZREM', KEYS[1], payload)
        break
    end
end
redis.call('RPUSH', KEYS[2], ARGV[2])
return redis.call('HDEL', KEYS[3], ARGV[1])
"#;

/// Requeues processing entries scored at or before the cutoff, oldest
/// first, preserving payloads (and with them attempt counts).
const RECOVER_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, payload in ipairs(expired) do
    redis.call('ZREM', KEYS[1], payload)
    redis.call('RPUSH', KEYS[2], payload)
    local item = cjson.decode(payload)
    redis.call('HDEL', KEYS[3], item.task_id)
end
return #expired
"#;

/// Moves selected dead entries (or all, when ARGV[1] == '*') back to
/// pending with attempts reset to zero.
const RETRY_DEAD_SCRIPT: &str = r#"
local moved = 0
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, payload in ipairs(entries) do
    local item = cjson.decode(payload)
    local wanted = ARGV[1] == '*'
    if not wanted then
        for i = 1, #ARGV do
            if ARGV[i] == item.task_id then
                wanted = true
                break
            end
        end
    end
    if wanted then
        redis.call('LREM', KEYS[1], 1, payload)
        item.attempts = 0
        redis.call('RPUSH', KEYS[2], cjson.encode(item))
        moved = moved + 1
    end
end
return moved
"#;

/// Distributed task queue over a shared Redis.
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    claim_timeout: Duration,
    claim: Script,
    complete: Script,
    requeue: Script,
    move_dead: Script,
    recover: Script,
    retry_dead: Script,
}

impl RedisQueue {
    /// Connects to Redis and prepares the transition scripts.
    ///
    /// `prefix` namespaces every key (e.g. `vessel:batch:`);
    /// `claim_timeout` is the visibility timeout for claimed items.
    pub async fn new(
        redis_url: &str,
        prefix: impl Into<String>,
        claim_timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            claim_timeout,
            claim: Script::new(CLAIM_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
            move_dead: Script::new(MOVE_DEAD_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            retry_dead: Script::new(RETRY_DEAD_SCRIPT),
        })
    }

    fn pending_key(&self, batch_id: &str) -> String {
        format!("{}{}:pending", self.prefix, batch_id)
    }

    fn processing_key(&self, batch_id: &str) -> String {
        format!("{}{}:processing", self.prefix, batch_id)
    }

    fn dead_key(&self, batch_id: &str) -> String {
        format!("{}{}:dead", self.prefix, batch_id)
    }

    fn claims_key(&self, batch_id: &str) -> String {
        format!("{}{}:claims", self.prefix, batch_id)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, batch_id: &str, items: &[QueueItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let payloads: Vec<String> = items
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<_, _>>()?;

        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.pending_key(batch_id), payloads)
            .await?;
        Ok(())
    }

    async fn claim(
        &self,
        batch_id: &str,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();
        let payloads: Vec<String> = self
            .claim
            .key(self.pending_key(batch_id))
            .key(self.processing_key(batch_id))
            .arg(now)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        let mut items = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            items.push(serde_json::from_str::<QueueItem>(payload)?);
        }

        // Claim ownership records are best-effort bookkeeping: the claim
        // itself already happened atomically above.
        if !items.is_empty() {
            let claims_key = self.claims_key(batch_id);
            let mut pipe = redis::pipe();
            for item in &items {
                pipe.hset(&claims_key, &item.task_id, worker_id);
            }
            if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                warn!("Failed to record claims for batch {}: {}", batch_id, e);
            }
            debug!(
                "Claimed {} task(s) for worker {} in batch {}",
                items.len(),
                worker_id,
                batch_id
            );
        }
        Ok(items)
    }

    async fn complete(&self, batch_id: &str, task_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = self
            .complete
            .key(self.processing_key(batch_id))
            .key(self.claims_key(batch_id))
            .arg(task_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, batch_id: &str, task_id: &str, attempts: u32) -> Result<()> {
        let payload = serde_json::to_string(&QueueItem {
            task_id: task_id.to_string(),
            batch_id: batch_id.to_string(),
            index: task_index_from_id(batch_id, task_id),
            attempts,
        })?;

        let mut conn = self.conn.clone();
        let _: () = self
            .requeue
            .key(self.processing_key(batch_id))
            .key(self.pending_key(batch_id))
            .key(self.claims_key(batch_id))
            .arg(task_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn move_to_dead(
        &self,
        batch_id: &str,
        task_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        let payload = serde_json::to_string(&QueueItem {
            task_id: task_id.to_string(),
            batch_id: batch_id.to_string(),
            index: task_index_from_id(batch_id, task_id),
            attempts,
        })?;

        let mut conn = self.conn.clone();
        let _: () = self
            .move_dead
            .key(self.processing_key(batch_id))
            .key(self.dead_key(batch_id))
            .key(self.claims_key(batch_id))
            .arg(task_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        debug!("Task {} moved to dead letter: {}", task_id, error);
        Ok(())
    }

    async fn recover_timed_out(&self, batch_id: &str) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - self.claim_timeout.as_secs() as i64;
        let mut conn = self.conn.clone();
        let recovered: usize = self
            .recover
            .key(self.processing_key(batch_id))
            .key(self.pending_key(batch_id))
            .key(self.claims_key(batch_id))
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered)
    }

    async fn list_dead(&self, batch_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        let stop: isize = if limit == 0 { -1 } else { limit as isize - 1 };
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn.lrange(self.dead_key(batch_id), 0, stop).await?;

        let mut items = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            items.push(serde_json::from_str::<QueueItem>(payload)?);
        }
        Ok(items)
    }

    async fn retry_dead(&self, batch_id: &str, ids: &[String]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut invocation = self.retry_dead.prepare_invoke();
        invocation
            .key(self.dead_key(batch_id))
            .key(self.pending_key(batch_id));
        if ids.is_empty() {
            invocation.arg("*");
        } else {
            for id in ids {
                invocation.arg(id);
            }
        }
        let moved: usize = invocation.invoke_async(&mut conn).await?;
        Ok(moved)
    }

    async fn stats(&self, batch_id: &str) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (pending, processing, dead): (u64, u64, u64) = redis::pipe()
            .llen(self.pending_key(batch_id))
            .zcard(self.processing_key(batch_id))
            .llen(self.dead_key(batch_id))
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            pending,
            processing,
            dead,
        })
    }

    async fn cleanup(&self, batch_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![
            self.pending_key(batch_id),
            self.processing_key(batch_id),
            self.dead_key(batch_id),
            self.claims_key(batch_id),
        ])
        .await?;
        Ok(())
    }
}

fn task_index_from_id(batch_id: &str, task_id: &str) -> u64 {
    task_id
        .strip_prefix(batch_id)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|idx| idx.parse().ok())
        .unwrap_or(0)
}
