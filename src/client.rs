//! Client interface for sending tasks

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::app::WorkerApp;
use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskDefinition, TaskStatus};
use crate::tasks::{Delete, Upload, UserId};

/// Typed entry point for enqueuing the cache tasks
#[derive(Clone)]
pub struct TaskClient {
    app: Arc<WorkerApp>,
}

impl TaskClient {
    pub fn new(app: Arc<WorkerApp>) -> Self {
        Self { app }
    }

    pub fn app(&self) -> &Arc<WorkerApp> {
        &self.app
    }

    /// Send any registered task
    pub async fn submit<T: Task>(&self, task: &T) -> TaskResult<TaskDefinition> {
        let task_def = TaskDefinition::new(task)?;
        self.app.send_task(task_def).await
    }

    /// Remove the cached record for `user`
    pub async fn delete(&self, user: impl Into<UserId>) -> TaskResult<TaskDefinition> {
        self.submit(&Delete { user: user.into() }).await
    }

    /// Cache `data` for `user`. Fails with a serialization error, before
    /// anything is sent, if `data` cannot be represented as JSON.
    pub async fn upload<D>(&self, user: impl Into<UserId>, data: &D) -> TaskResult<TaskDefinition>
    where
        D: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        self.submit(&Upload {
            user: user.into(),
            data,
        })
        .await
    }

    /// Wait for a sent task to finish and decode its result. Eagerly run
    /// tasks are already finished; queued ones are polled in the result
    /// backend every 500ms.
    pub async fn wait_for_result<R>(
        &self,
        task_def: &TaskDefinition,
        timeout: Option<Duration>,
    ) -> TaskResult<R>
    where
        R: DeserializeOwned,
    {
        if task_def.status.is_finished() {
            return decode_result(task_def);
        }

        let queue = self
            .app
            .queue()
            .ok_or_else(|| TaskError::task_execution("eager task did not finish"))?;
        let start = Instant::now();

        loop {
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    return Err(TaskError::timeout("wait_for_result"));
                }
            }

            match queue.get_task(task_def.id).await? {
                Some(current) if current.status.is_finished() => return decode_result(&current),
                Some(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                None => {
                    return Err(TaskError::TaskNotFound {
                        task_id: task_def.id.to_string(),
                    })
                }
            }
        }
    }
}

fn decode_result<R: DeserializeOwned>(task_def: &TaskDefinition) -> TaskResult<R> {
    match task_def.status {
        TaskStatus::Success => {
            let json = task_def
                .result
                .as_deref()
                .ok_or_else(|| TaskError::task_execution("Task completed but no result found"))?;
            Ok(serde_json::from_str(json)?)
        }
        _ => Err(TaskError::task_execution(
            task_def
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
        )),
    }
}
