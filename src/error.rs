use thiserror::Error;

/// Convenience type alias for Results with VesselError
pub type Result<T> = std::result::Result<T, VesselError>;

/// Main error type for Vessel Core
///
/// Covers the closed set of error kinds the core surfaces to callers,
/// plus conversions for the transport and serialization layers it sits on.
#[derive(Error, Debug)]
pub enum VesselError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Batch already running: {0}")]
    AlreadyRunning(String),

    #[error("Batch not running: {0}")]
    NotRunning(String),

    #[error("Capacity exhausted: {running} of {max} batches running")]
    CapacityExhausted { running: usize, max: usize },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Container error: {message}")]
    Container { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
