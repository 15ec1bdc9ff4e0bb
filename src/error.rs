//! Error types for the contextgraph worker

use thiserror::Error;

/// Result type alias for task and cache operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised by handlers, the cache client and the queue runtime
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis connection or command errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload or task metadata could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler returned an error
    #[error("Task execution failed: {message}")]
    TaskExecution { message: String },

    /// No task with this id is known to the result backend
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// No handler is registered under this name
    #[error("Task not registered: {name}")]
    UnregisteredTask { name: String },

    /// A cache key could not be derived
    #[error("Invalid cache key: {reason}")]
    InvalidKey { reason: String },

    /// Cache operation errors that are not Redis protocol errors
    #[error("Cache operation failed: {operation}: {reason}")]
    Cache { operation: String, reason: String },

    /// Broker operation errors
    #[error("Queue operation failed: {operation}: {reason}")]
    QueueOperation { operation: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Task retry limit exceeded
    #[error("Task retry limit exceeded: {task_id} (max retries: {max_retries})")]
    RetryLimitExceeded { task_id: String, max_retries: u32 },
}

impl TaskError {
    /// Create a task execution error
    pub fn task_execution<S: Into<String>>(message: S) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }

    /// Create a cache operation error
    pub fn cache<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        Self::Cache {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        Self::QueueOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_key<S: Into<String>>(reason: S) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is worth retrying. Bad input never is.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(_) => true,
            TaskError::Timeout { .. } => true,
            TaskError::QueueOperation { .. } => true,
            TaskError::Cache { .. } => true,
            TaskError::TaskExecution { .. } => true,
            TaskError::Serialization(_) => false,
            TaskError::InvalidKey { .. } => false,
            TaskError::UnregisteredTask { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::RetryLimitExceeded { .. } => false,
        }
    }
}
