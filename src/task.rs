//! Task definitions and management

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

use crate::config::DEFAULT_QUEUE;
use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Task execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is waiting to be processed
    Pending,
    /// Task is currently being processed
    Running,
    /// Task completed successfully
    Success,
    /// Task failed with an error
    Failed,
    /// Task failed and waits for another attempt
    Retrying,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// Configuration for task retry behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries in seconds
    pub retry_delay: u64,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
    /// Maximum delay between retries in seconds
    pub max_delay: u64,
}

impl Default for RetryConfig {
    /// No retries; tasks opt in by overriding [`Task::retry_config`].
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: 5,
            exponential_backoff: true,
            max_delay: 300, // 5 minutes
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before the given (1-based) retry attempt, in seconds.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        if self.exponential_backoff {
            let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
            self.retry_delay.saturating_mul(factor).min(self.max_delay)
        } else {
            self.retry_delay
        }
    }
}

/// A unit of work that can be enqueued by name and run by a worker.
///
/// Arguments travel as the serialized task value. Structs with named fields
/// also accept a positional JSON array, so `["42", {"a": 1}]` is a valid
/// argument list for a task with fields `user` and `data`.
#[async_trait]
pub trait Task: Send + Sync + Debug + Serialize {
    /// Name the task is registered and enqueued under
    const NAME: &'static str;

    /// The output type of the task
    type Output: Send + Sync + Serialize + for<'de> Deserialize<'de>;

    /// Execute the task against the worker's context
    async fn execute(&self, ctx: &TaskContext) -> TaskResult<Self::Output>;

    /// Queue the task is registered on and routed to
    const QUEUE: &'static str = DEFAULT_QUEUE;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig::default()
    }
}

/// Complete task definition with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task identifier
    pub id: TaskId,
    /// Registered task name
    pub name: String,
    /// Serialized task arguments
    pub args: String,
    /// Queue name
    pub queue: String,
    /// Current task status
    pub status: TaskStatus,
    /// Retry configuration
    pub retry_config: RetryConfig,
    /// Current retry attempt
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the next attempt may run
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// JSON-encoded result (if completed)
    pub result: Option<String>,
    /// Error message (if failed)
    pub error: Option<String>,
    /// Worker ID that processed the task
    pub worker_id: Option<String>,
}

impl TaskDefinition {
    /// Create a definition for `task` on its own queue
    pub fn new<T: Task>(task: &T) -> TaskResult<Self> {
        let args = serde_json::to_string(task)?;
        Ok(Self::from_parts(T::NAME, T::QUEUE, args, task.retry_config()))
    }

    /// Create a definition from a task name and raw JSON arguments
    pub fn from_parts(name: &str, queue: &str, args: String, retry_config: RetryConfig) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new_v4(),
            name: name.to_string(),
            args,
            queue: queue.to_string(),
            status: TaskStatus::Pending,
            retry_config,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            worker_id: None,
        }
    }

    /// Mark task as started
    pub fn mark_started(&mut self, worker_id: String) {
        let now = Utc::now();
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        self.worker_id = Some(worker_id);
    }

    /// Mark task as completed with an already serialized result
    pub fn mark_success(&mut self, result: String) {
        let now = Utc::now();
        self.status = TaskStatus::Success;
        self.finished_at = Some(now);
        self.updated_at = now;
        self.result = Some(result);
        self.error = None;
    }

    /// Mark task as failed
    pub fn mark_failed(&mut self, error: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.finished_at = Some(now);
        self.updated_at = now;
        self.error = Some(error.to_string());
    }

    /// Mark task for retry and schedule the next attempt
    pub fn mark_retry(&mut self, error: &str) -> TaskResult<()> {
        if !self.can_retry() {
            return Err(TaskError::RetryLimitExceeded {
                task_id: self.id.to_string(),
                max_retries: self.retry_config.max_retries,
            });
        }

        self.retry_count += 1;
        let now = Utc::now();
        let delay = self.retry_config.delay_for(self.retry_count);

        self.status = TaskStatus::Retrying;
        self.updated_at = now;
        self.started_at = None;
        self.finished_at = None;
        self.worker_id = None;
        self.error = Some(error.to_string());
        self.scheduled_at = Some(now + chrono::Duration::seconds(delay as i64));
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.retry_config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_config_disables_retries() {
        let def = TaskDefinition::from_parts(
            "error",
            DEFAULT_QUEUE,
            "null".into(),
            RetryConfig::default(),
        );
        assert!(!def.can_retry());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            retry_delay: 5,
            exponential_backoff: true,
            max_delay: 30,
        };
        assert_eq!(config.delay_for(1), 5);
        assert_eq!(config.delay_for(2), 10);
        assert_eq!(config.delay_for(3), 20);
        assert_eq!(config.delay_for(4), 30);
        assert_eq!(config.delay_for(40), 30);
    }

    #[test]
    fn test_mark_retry_until_limit() {
        let mut def = TaskDefinition::from_parts(
            "upload",
            DEFAULT_QUEUE,
            "[]".into(),
            RetryConfig::with_retries(2),
        );

        def.mark_retry("boom").unwrap();
        assert_eq!(def.status, TaskStatus::Retrying);
        assert_eq!(def.retry_count, 1);
        assert!(def.scheduled_at.is_some_and(|at| at > Utc::now()));

        def.mark_retry("boom").unwrap();
        assert!(matches!(
            def.mark_retry("boom"),
            Err(TaskError::RetryLimitExceeded { max_retries: 2, .. })
        ));
    }

    #[test]
    fn test_success_and_failure_transitions() {
        let mut def = TaskDefinition::from_parts(
            "dummy",
            DEFAULT_QUEUE,
            "null".into(),
            RetryConfig::default(),
        );
        def.mark_started("worker-1".into());
        assert_eq!(def.status, TaskStatus::Running);
        assert!(!def.status.is_finished());

        def.mark_success("2".into());
        assert_eq!(def.status, TaskStatus::Success);
        assert_eq!(def.result.as_deref(), Some("2"));
        assert!(def.finished_at.is_some());

        def.mark_failed("fail");
        assert_eq!(def.status, TaskStatus::Failed);
        assert_eq!(def.error.as_deref(), Some("fail"));
    }
}
