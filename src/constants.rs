//! System-wide constants and scheduling defaults.

/// Maximum number of simultaneously Running batches.
pub const DEFAULT_MAX_BATCHES: usize = 10;

/// Dispatcher poll period in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Progress reporter tick period in milliseconds.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Visibility timeout for claimed queue items, in seconds. Processing
/// entries older than this are reclaimable.
pub const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 300;

/// Period of the queue reclaim scan, in seconds.
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 30;

/// Delay before startup crash recovery scans the store, in seconds.
/// Gives collaborators (queue connections, container runtime) time to come up.
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 3;

/// Default worker count per batch.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default per-task execution deadline, in seconds.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Default retry budget per task. Zero means a single attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Capacity of each event subscriber's channel. Publishing to a full
/// subscriber drops the event for that subscriber only.
pub const EVENT_BUFFER_SIZE: usize = 100;

/// Ring buffer capacity for recent completion timestamps, used for
/// throughput and ETA computation.
pub const COMPLETION_WINDOW: usize = 100;

/// The task channel between dispatcher and workers holds this many tasks
/// per unit of batch concurrency.
pub const TASK_CHANNEL_FACTOR: usize = 2;

/// Error histogram keys are truncated to this many characters.
pub const ERROR_KEY_MAX_CHARS: usize = 50;

/// Batch counters are persisted to the store every this many completions;
/// the store's atomic counter updates stay fresh in between.
pub const COUNTER_PERSIST_INTERVAL: u32 = 10;

/// Key namespace for the Redis queue backend.
pub const QUEUE_KEY_PREFIX: &str = "vessel:batch:";
