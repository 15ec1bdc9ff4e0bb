//! The worker runtime instance
//!
//! A [`WorkerApp`] is built once at startup from explicit configuration and
//! passed by reference to whatever registers or sends tasks.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};
use crate::queue::{TaskQueue, TaskQueueConfig};
use crate::task::{Task, TaskDefinition};
use crate::worker::{run_handler, TaskHandlerRegistry, TypedHandler, Worker, WorkerConfig};

pub struct WorkerApp {
    config: AppConfig,
    context: Arc<TaskContext>,
    registry: Arc<TaskHandlerRegistry>,
    queue: Option<Arc<TaskQueue>>,
}

impl WorkerApp {
    /// Create the runtime. The broker is only contacted when tasks are not
    /// executed eagerly.
    pub async fn new(config: AppConfig, context: TaskContext) -> TaskResult<Self> {
        config.validate()?;

        let queue = if config.always_eager {
            info!("Running tasks eagerly, no broker connection");
            None
        } else {
            Some(Arc::new(TaskQueue::new(TaskQueueConfig::from(&config)).await?))
        };

        Ok(Self {
            config,
            context: Arc::new(context),
            registry: Arc::new(TaskHandlerRegistry::default()),
            queue,
        })
    }

    /// Create the runtime with the default context for `config`
    pub async fn from_config(config: AppConfig) -> TaskResult<Self> {
        let context = TaskContext::from_config(&config).await?;
        Self::new(config, context).await
    }

    pub fn conf(&self) -> &AppConfig {
        &self.config
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn queue(&self) -> Option<&Arc<TaskQueue>> {
        self.queue.as_ref()
    }

    /// Register `T` under its name on the queue it routes to
    pub async fn register<T>(&self)
    where
        T: Task + DeserializeOwned + 'static,
    {
        self.registry
            .register(T::NAME, T::QUEUE, TypedHandler::<T>::new())
            .await;
    }

    /// Registered task names, sorted
    pub async fn registered(&self) -> Vec<String> {
        self.registry.names().await
    }

    /// Send a task. In eager mode it runs before this returns and the
    /// finished definition comes back; a failure is recorded in the
    /// definition, not returned as an error. Otherwise the task is enqueued
    /// and returned pending.
    pub async fn send_task(&self, mut task_def: TaskDefinition) -> TaskResult<TaskDefinition> {
        let registration =
            self.registry
                .find(&task_def.name)
                .await
                .ok_or_else(|| TaskError::UnregisteredTask {
                    name: task_def.name.clone(),
                })?;

        if task_def.queue.is_empty() {
            task_def.queue = registration.queue.clone();
        }

        match &self.queue {
            None => {
                task_def.mark_started("eager".to_string());
                match run_handler(&task_def, registration.handler.as_ref(), &self.context, None)
                    .await
                {
                    Ok(result) => task_def.mark_success(result),
                    Err(e) => task_def.mark_failed(&e.to_string()),
                }
                debug!("Eagerly ran task {} ({:?})", task_def.name, task_def.status);
                Ok(task_def)
            }
            Some(queue) => {
                queue.submit_task(task_def.clone()).await?;
                Ok(task_def)
            }
        }
    }

    /// Build a worker consuming this app's broker
    pub fn worker(&self, config: WorkerConfig) -> TaskResult<Worker> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| TaskError::config("eager mode has no broker to consume"))?;

        Ok(Worker::new(
            config,
            queue,
            self.registry.clone(),
            self.context.clone(),
        ))
    }
}
