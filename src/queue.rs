//! Broker and result backend on Redis
//!
//! Each queue is a Redis list of JSON task definitions. Retries wait in a
//! sorted set scored by their ready time until `process_scheduled_tasks`
//! moves them back. Task state lives in the result backend so clients can
//! poll it by id.

use redis::aio::Connection;
use redis::Client;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskDefinition, TaskId, TaskStatus};

const KEY_PREFIX: &str = "cg";

fn queue_key(queue: &str) -> String {
    format!("{}:queue:{}", KEY_PREFIX, queue)
}

fn delayed_key() -> String {
    format!("{}:delayed", KEY_PREFIX)
}

fn task_key(task_id: TaskId) -> String {
    format!("{}:task:{}", KEY_PREFIX, task_id)
}

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub broker_url: String,
    pub result_backend: String,
    /// Queue used when a definition names none
    pub default_queue: String,
    /// Task result TTL in seconds
    pub result_ttl: u64,
    /// Failed task TTL in seconds
    pub failed_ttl: u64,
}

impl From<&AppConfig> for TaskQueueConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            broker_url: config.broker_url.clone(),
            result_backend: config.result_backend.clone(),
            default_queue: config.default_queue.clone(),
            result_ttl: config.result_ttl,
            failed_ttl: config.failed_ttl,
        }
    }
}

/// Redis-backed task broker
#[derive(Debug)]
pub struct TaskQueue {
    broker: Client,
    backend: Client,
    config: TaskQueueConfig,
}

impl TaskQueue {
    /// Connect to the broker and result backend
    pub async fn new(config: TaskQueueConfig) -> TaskResult<Self> {
        let broker = open(&config.broker_url).await?;
        let backend = open(&config.result_backend).await?;

        info!(
            "Connected to broker at {} and result backend at {}",
            config.broker_url, config.result_backend
        );

        Ok(Self {
            broker,
            backend,
            config,
        })
    }

    async fn broker_connection(&self) -> TaskResult<Connection> {
        self.broker
            .get_async_connection()
            .await
            .map_err(|e| TaskError::queue_operation("get_connection", e.to_string()))
    }

    async fn backend_connection(&self) -> TaskResult<Connection> {
        self.backend
            .get_async_connection()
            .await
            .map_err(|e| TaskError::queue_operation("get_connection", e.to_string()))
    }

    /// Push a task onto its queue
    pub async fn submit_task(&self, mut task_def: TaskDefinition) -> TaskResult<TaskId> {
        if task_def.queue.is_empty() {
            task_def.queue = self.config.default_queue.clone();
        }

        self.store_state(&task_def, None).await?;

        let task_json = serde_json::to_string(&task_def)?;
        let mut conn = self.broker_connection().await?;
        redis::cmd("RPUSH")
            .arg(queue_key(&task_def.queue))
            .arg(&task_json)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("submit", e.to_string()))?;

        debug!("Submitted task {} to queue {}", task_def.id, task_def.queue);
        Ok(task_def.id)
    }

    /// Park a task until its `scheduled_at` time
    pub async fn submit_delayed_task(&self, task_def: TaskDefinition) -> TaskResult<TaskId> {
        let ready_at = task_def
            .scheduled_at
            .ok_or_else(|| TaskError::queue_operation("submit_delayed", "missing scheduled_at"))?
            .timestamp();

        self.store_state(&task_def, None).await?;

        let task_json = serde_json::to_string(&task_def)?;
        let mut conn = self.broker_connection().await?;
        redis::cmd("ZADD")
            .arg(delayed_key())
            .arg(ready_at)
            .arg(&task_json)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("submit_delayed", e.to_string()))?;

        debug!("Delayed task {} until {:?}", task_def.id, task_def.scheduled_at);
        Ok(task_def.id)
    }

    /// Pop the next task from a queue
    pub async fn get_next_task(&self, queue_name: &str) -> TaskResult<Option<TaskDefinition>> {
        let mut conn = self.broker_connection().await?;

        let task_json: Option<String> = redis::cmd("LPOP")
            .arg(queue_key(queue_name))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("get_next", e.to_string()))?;

        match task_json {
            Some(json) => {
                let task_def: TaskDefinition = serde_json::from_str(&json)?;
                debug!("Retrieved task {} from queue {}", task_def.id, queue_name);
                Ok(Some(task_def))
            }
            None => Ok(None),
        }
    }

    /// Move delayed tasks whose time has come back onto their queues
    pub async fn process_scheduled_tasks(&self) -> TaskResult<u64> {
        let mut conn = self.broker_connection().await?;
        let now = chrono::Utc::now().timestamp();

        let ready: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(delayed_key())
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("get_delayed", e.to_string()))?;

        let mut moved = 0;

        for task_json in ready {
            // Another worker may have claimed it first
            let removed: u64 = redis::cmd("ZREM")
                .arg(delayed_key())
                .arg(&task_json)
                .query_async(&mut conn)
                .await
                .map_err(|e| TaskError::queue_operation("claim_delayed", e.to_string()))?;
            if removed == 0 {
                continue;
            }

            let mut task_def: TaskDefinition = serde_json::from_str(&task_json)?;
            task_def.status = TaskStatus::Pending;
            task_def.scheduled_at = None;
            self.submit_task(task_def).await?;
            moved += 1;
        }

        if moved > 0 {
            info!("Moved {} delayed tasks back to their queues", moved);
        }

        Ok(moved)
    }

    /// Record a finished task in the result backend
    pub async fn mark_task_completed(&self, task_def: &TaskDefinition) -> TaskResult<()> {
        self.store_state(task_def, Some(self.config.result_ttl)).await?;
        debug!("Marked task {} as completed", task_def.id);
        Ok(())
    }

    /// Record a failed task in the result backend
    pub async fn mark_task_failed(&self, task_def: &TaskDefinition) -> TaskResult<()> {
        self.store_state(task_def, Some(self.config.failed_ttl)).await?;
        debug!("Marked task {} as failed", task_def.id);
        Ok(())
    }

    /// Requeue a task for retry
    pub async fn requeue_task(&self, task_def: &TaskDefinition) -> TaskResult<()> {
        if task_def.scheduled_at.is_some() {
            self.submit_delayed_task(task_def.clone()).await?;
        } else {
            self.submit_task(task_def.clone()).await?;
        }

        debug!("Requeued task {} for retry", task_def.id);
        Ok(())
    }

    /// Get task state by ID
    pub async fn get_task(&self, task_id: TaskId) -> TaskResult<Option<TaskDefinition>> {
        let mut conn = self.backend_connection().await?;

        let task_data: Option<String> = redis::cmd("GET")
            .arg(task_key(task_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("get_task", e.to_string()))?;

        match task_data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_state(&self, task_def: &TaskDefinition, ttl: Option<u64>) -> TaskResult<()> {
        let task_json = serde_json::to_string(task_def)?;
        let mut conn = self.backend_connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(task_key(task_def.id)).arg(&task_json);
        if let Some(seconds) = ttl {
            cmd.arg("EX").arg(seconds);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::queue_operation("store_state", e.to_string()))
    }
}

async fn open(url: &str) -> TaskResult<Client> {
    let client =
        Client::open(url).map_err(|e| TaskError::queue_operation("connect", e.to_string()))?;

    let mut conn = client
        .get_async_connection()
        .await
        .map_err(|e| TaskError::queue_operation("connect", e.to_string()))?;

    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .map_err(|e| TaskError::queue_operation("ping", e.to_string()))?;

    Ok(client)
}
