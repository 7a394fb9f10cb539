use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A homogeneous collection of tasks sharing a template, agent, and
/// concurrency. Batches are the unit of scheduling: the manager persists
/// them, spawns a worker pool for them, and reports progress against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Opaque reference naming which agent configuration to drive.
    pub agent_ref: String,
    pub template: Template,
    pub concurrency: usize,
    pub status: BatchStatus,
    /// Task count, fixed at creation.
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    /// Dead-letter count, derived from the dead-letter set and kept
    /// current through counter updates.
    pub dead: u64,
    /// Error-type histogram keyed on truncated error text.
    pub error_counts: HashMap<String, u64>,
    /// Worker roster while the batch is Running or Paused; empty otherwise.
    pub workers: Vec<WorkerInfo>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Batch lifecycle states. Transitions are monotonic except
/// `Paused -> Running` (resume) and `Completed|Failed -> Pending`
/// (retry-failed reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// Prompt template and per-task execution policy shared by every task of
/// a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Prompt text with `{{.field}}` placeholders resolved against each
    /// task's input mapping at execution time.
    pub prompt: String,
    /// Per-task execution deadline in seconds.
    pub timeout_secs: u64,
    /// Retry budget for transient task errors. Zero means one attempt.
    pub max_retries: u32,
}

/// One worker of a running batch: a long-lived fiber bound to a container
/// session for its full lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub session_id: String,
    pub busy: bool,
    pub current_task: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One invocation of the agent on one input mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    /// `<batch_id>-<index>`.
    pub id: String,
    pub batch_id: String,
    /// Zero-based position within the batch.
    pub index: u64,
    /// Key/value mapping used to render the prompt.
    pub input: HashMap<String, String>,
    /// Rendered prompt, set at execution time.
    pub prompt: Option<String>,
    pub status: TaskStatus,
    /// Owning worker while Running.
    pub worker_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Monotonic attempt count; reset to zero only by explicit retry-dead.
    pub attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub dead_at: Option<DateTime<Utc>>,
    pub dead_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Dead
        )
    }
}

/// Queue-local shadow of a task. The store remains the source of truth for
/// task content; the queue distributes these minimal references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub task_id: String,
    pub batch_id: String,
    pub index: u64,
    pub attempts: u32,
}

impl QueueItem {
    pub fn from_task(task: &BatchTask) -> Self {
        Self {
            task_id: task.id.clone(),
            batch_id: task.batch_id.clone(),
            index: task.index,
            attempts: task.attempts,
        }
    }
}

/// Filter for batch listings. A `limit` of zero means unbounded.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub user_id: Option<String>,
    pub status: Option<BatchStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// Filter for task listings within a batch. A `limit` of zero means
/// unbounded.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// Aggregated per-batch task counts as observed by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    /// Mean duration over completed tasks, in milliseconds.
    pub avg_duration_ms: f64,
    pub error_counts: HashMap<String, u64>,
}

/// Generates a new batch identifier: `batch-` plus 8 lowercase hex chars.
pub fn new_batch_id() -> String {
    format!("batch-{:08x}", rand::random::<u32>())
}

/// Histogram key for an error: the first [`crate::constants::ERROR_KEY_MAX_CHARS`]
/// characters, truncated with an ellipsis.
pub fn error_key(error: &str) -> String {
    let max = crate::constants::ERROR_KEY_MAX_CHARS;
    if error.chars().count() <= max {
        error.to_string()
    } else {
        let mut key: String = error.chars().take(max).collect();
        key.push('…');
        key
    }
}

/// Builds the task identifier for a batch position.
pub fn task_id(batch_id: &str, index: u64) -> String {
    format!("{batch_id}-{index}")
}

impl Batch {
    /// Creates a new Pending batch. `total` is fixed to the input count and
    /// never changes afterwards.
    pub fn new(
        user_id: String,
        name: String,
        agent_ref: String,
        template: Template,
        concurrency: usize,
        total: u64,
    ) -> Self {
        Self {
            id: new_batch_id(),
            user_id,
            name,
            agent_ref,
            template,
            concurrency,
            status: BatchStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            dead: 0,
            error_counts: HashMap::new(),
            workers: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

impl BatchTask {
    /// Creates a Pending task at the given batch position.
    pub fn new(batch_id: &str, index: u64, input: HashMap<String, String>) -> Self {
        Self {
            id: task_id(batch_id, index),
            batch_id: batch_id.to_string(),
            index,
            input,
            prompt: None,
            status: TaskStatus::Pending,
            worker_id: None,
            result: None,
            error: None,
            attempts: 0,
            claimed_at: None,
            claimed_by: None,
            dead_at: None,
            dead_reason: None,
            started_at: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_format() {
        let id = new_batch_id();
        assert!(id.starts_with("batch-"));
        let suffix = &id["batch-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_task_id_includes_batch_prefix_and_index() {
        assert_eq!(task_id("batch-00c0ffee", 7), "batch-00c0ffee-7");
    }

    #[test]
    fn test_new_batch_starts_pending_with_zero_counters() {
        let template = Template {
            prompt: "Say {{.x}}".to_string(),
            timeout_secs: 300,
            max_retries: 0,
        };
        let batch = Batch::new(
            "user1".to_string(),
            "demo".to_string(),
            "claude".to_string(),
            template,
            5,
            3,
        );
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total, 3);
        assert_eq!(batch.completed + batch.failed + batch.dead, 0);
        assert!(batch.workers.is_empty());
    }

    #[test]
    fn test_queue_item_round_trips_through_json() {
        let item = QueueItem {
            task_id: "batch-00c0ffee-0".to_string(),
            batch_id: "batch-00c0ffee".to_string(),
            index: 0,
            attempts: 2,
        };
        let encoded = serde_json::to_string(&item).unwrap();
        let decoded: QueueItem = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_error_key_truncates_long_errors() {
        let short = "connection refused";
        assert_eq!(error_key(short), short);

        let long = "x".repeat(80);
        let key = error_key(&long);
        assert_eq!(key.chars().count(), 51);
        assert!(key.ends_with('…'));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Paused.is_terminal());
        assert!(TaskStatus::Dead.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
