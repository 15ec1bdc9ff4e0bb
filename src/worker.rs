//! Worker implementation for processing tasks

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_QUEUE;
use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};
use crate::queue::TaskQueue;
use crate::task::{Task, TaskDefinition, TaskId};

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Queues this worker will process
    pub queues: Vec<String>,
    pub max_concurrent_tasks: usize,
    /// Polling interval for new tasks in milliseconds
    pub polling_interval_ms: u64,
    /// Task execution timeout in seconds
    pub task_timeout: u64,
    /// Retry recoverable failures per each task's retry config
    pub auto_retry: bool,
    /// How often delayed retries are promoted, in seconds
    pub delayed_check_interval: u64,
    /// Worker shutdown grace period in seconds
    pub shutdown_grace_period: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            max_concurrent_tasks: 4,
            polling_interval_ms: 1000,
            task_timeout: 300, // 5 minutes
            auto_retry: true,
            delayed_check_interval: 10,
            shutdown_grace_period: 30,
        }
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub average_execution_time_ms: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl WorkerStats {
    fn record(&mut self, elapsed: Duration) {
        self.tasks_processed += 1;
        let millis = elapsed.as_millis() as f64;
        self.average_execution_time_ms = if self.tasks_processed == 1 {
            millis
        } else {
            (self.average_execution_time_ms * (self.tasks_processed - 1) as f64 + millis)
                / self.tasks_processed as f64
        };
    }
}

/// Runs one kind of task from its serialized arguments
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, args: &str) -> TaskResult<String>;
}

/// Handler that decodes the arguments into `T` and executes it
pub struct TypedHandler<T> {
    _task: PhantomData<fn() -> T>,
}

impl<T> TypedHandler<T> {
    pub fn new() -> Self {
        Self { _task: PhantomData }
    }
}

impl<T> Default for TypedHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<T> TaskHandler for TypedHandler<T>
where
    T: Task + DeserializeOwned + 'static,
{
    async fn handle(&self, ctx: &TaskContext, args: &str) -> TaskResult<String> {
        let task: T = serde_json::from_str(args)?;
        let output = task.execute(ctx).await?;
        Ok(serde_json::to_string(&output)?)
    }
}

/// A handler together with the queue it is routed to
#[derive(Clone)]
pub struct Registration {
    pub queue: String,
    pub handler: Arc<dyn TaskHandler>,
}

/// Registry for task handlers, keyed by task name
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Registration>>,
}

impl TaskHandlerRegistry {
    pub async fn register<H>(&self, task_name: &str, queue: &str, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(task_name) {
            warn!("Replacing handler for task {}", task_name);
        }
        handlers.insert(
            task_name.to_string(),
            Registration {
                queue: queue.to_string(),
                handler: Arc::new(handler),
            },
        );
        debug!("Registered task {} on queue {}", task_name, queue);
    }

    pub async fn find(&self, task_name: &str) -> Option<Registration> {
        self.handlers.read().await.get(task_name).cloned()
    }

    /// Registered task names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Run one attempt of a task: the handler call under an optional timeout,
/// timing stats, and failure reporting. The definition's status is left to
/// the caller.
pub async fn run_handler(
    task_def: &TaskDefinition,
    handler: &dyn TaskHandler,
    ctx: &TaskContext,
    timeout: Option<Duration>,
) -> TaskResult<String> {
    let start = Instant::now();
    let call = handler.handle(ctx, &task_def.args);

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::timeout(format!(
                "task {} after {} seconds",
                task_def.name,
                limit.as_secs()
            ))),
        },
        None => call.await,
    };

    ctx.stats.timing(
        &format!("task.{}.duration_ms", task_def.name),
        start.elapsed().as_millis() as u64,
    );

    match &result {
        Ok(_) => ctx.stats.incr(&format!("task.{}.success", task_def.name), 1),
        Err(e) => ctx.report_failure(task_def, &e.to_string()),
    }

    result
}

/// What the worker does with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    Fail,
}

/// Retry only recoverable errors, and only while the task has attempts left.
pub fn failure_action(
    config: &WorkerConfig,
    task_def: &TaskDefinition,
    error: &TaskError,
) -> FailureAction {
    if config.auto_retry && error.is_recoverable() && task_def.can_retry() {
        FailureAction::Retry
    } else {
        FailureAction::Fail
    }
}

/// Worker for processing tasks from the queue
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    handlers: Arc<TaskHandlerRegistry>,
    context: Arc<TaskContext>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown_signal: Arc<RwLock<bool>>,
    active_tasks: Arc<RwLock<HashMap<TaskId, JoinHandle<()>>>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<TaskQueue>,
        handlers: Arc<TaskHandlerRegistry>,
        context: Arc<TaskContext>,
    ) -> Self {
        let stats = WorkerStats {
            started_at: chrono::Utc::now(),
            ..WorkerStats::default()
        };

        Self {
            config,
            queue,
            handlers,
            context,
            stats: Arc::new(Mutex::new(stats)),
            shutdown_signal: Arc::new(RwLock::new(false)),
            active_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run until the polling loop stops, then shut down gracefully
    pub async fn start(&self) -> TaskResult<()> {
        info!(
            "Starting worker {} for queues: {:?}",
            self.config.worker_id, self.config.queues
        );

        let delayed_task = self.start_delayed_task();
        let worker_task = self.start_worker_loop();

        tokio::select! {
            _ = delayed_task => {
                warn!("Delayed task promoter completed unexpectedly");
            }
            _ = worker_task => {
                info!("Worker loop completed");
            }
        }

        self.shutdown().await
    }

    fn start_worker_loop(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let queue = self.queue.clone();
        let handlers = self.handlers.clone();
        let context = self.context.clone();
        let stats = self.stats.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let active_tasks = self.active_tasks.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(config.polling_interval_ms));

            loop {
                ticker.tick().await;

                if *shutdown_signal.read().await {
                    break;
                }

                Self::reap_finished(&active_tasks).await;

                for queue_name in &config.queues {
                    if active_tasks.read().await.len() >= config.max_concurrent_tasks {
                        break;
                    }

                    let mut task_def = match queue.get_next_task(queue_name).await {
                        Ok(Some(task_def)) => task_def,
                        Ok(None) => continue,
                        Err(e) => {
                            error!("Failed to fetch from queue {}: {}", queue_name, e);
                            continue;
                        }
                    };

                    task_def.mark_started(config.worker_id.to_string());

                    match handlers.find(&task_def.name).await {
                        Some(registration) => {
                            let task_id = task_def.id;
                            let handle = Self::spawn_task_execution(
                                task_def,
                                registration.handler,
                                queue.clone(),
                                context.clone(),
                                stats.clone(),
                                config.clone(),
                            );
                            active_tasks.write().await.insert(task_id, handle);
                        }
                        None => {
                            let err = TaskError::UnregisteredTask {
                                name: task_def.name.clone(),
                            };
                            let message = err.to_string();
                            error!("{}", message);
                            context.report_failure(&task_def, &message);
                            task_def.mark_failed(&message);
                            if let Err(e) = queue.mark_task_failed(&task_def).await {
                                error!("Failed to mark task as failed: {}", e);
                            }
                        }
                    }
                }
            }

            info!("Worker loop shutting down");
        })
    }

    fn spawn_task_execution(
        mut task_def: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
        queue: Arc<TaskQueue>,
        context: Arc<TaskContext>,
        stats: Arc<Mutex<WorkerStats>>,
        config: WorkerConfig,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = Instant::now();
            let timeout = Some(Duration::from_secs(config.task_timeout));
            let outcome = run_handler(&task_def, handler.as_ref(), &context, timeout).await;
            let elapsed = start.elapsed();

            stats.lock().await.record(elapsed);

            match outcome {
                Ok(result) => {
                    task_def.mark_success(result);
                    stats.lock().await.tasks_successful += 1;

                    if let Err(e) = queue.mark_task_completed(&task_def).await {
                        error!("Failed to mark task as completed: {}", e);
                    }

                    info!("Task {} completed successfully in {:?}", task_def.id, elapsed);
                }
                Err(e) => {
                    let message = e.to_string();

                    if failure_action(&config, &task_def, &e) == FailureAction::Retry {
                        match task_def.mark_retry(&message) {
                            Ok(()) => match queue.requeue_task(&task_def).await {
                                Ok(()) => {
                                    stats.lock().await.tasks_retried += 1;
                                    info!(
                                        "Task {} queued for retry (attempt {})",
                                        task_def.id, task_def.retry_count
                                    );
                                    return;
                                }
                                Err(e) => error!("Failed to requeue task for retry: {}", e),
                            },
                            Err(e) => warn!("{}", e),
                        }
                    }

                    task_def.mark_failed(&message);
                    stats.lock().await.tasks_failed += 1;

                    if let Err(e) = queue.mark_task_failed(&task_def).await {
                        error!("Failed to mark task as failed: {}", e);
                    }
                }
            }
        })
    }

    async fn reap_finished(active_tasks: &RwLock<HashMap<TaskId, JoinHandle<()>>>) {
        active_tasks
            .write()
            .await
            .retain(|_, handle| !handle.is_finished());
    }

    /// Promote delayed retries whose time has come
    fn start_delayed_task(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let period = Duration::from_secs(self.config.delayed_check_interval.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;

                if *shutdown_signal.read().await {
                    break;
                }

                if let Err(e) = queue.process_scheduled_tasks().await {
                    error!("Failed to process delayed tasks: {}", e);
                }
            }
        })
    }

    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Ask the polling loop to stop after its current tick
    pub async fn signal_shutdown(&self) {
        *self.shutdown_signal.write().await = true;
    }

    async fn shutdown(&self) -> TaskResult<()> {
        info!("Shutting down worker {}", self.config.worker_id);

        self.signal_shutdown().await;

        let start = Instant::now();
        let grace_period = Duration::from_secs(self.config.shutdown_grace_period);

        while start.elapsed() < grace_period {
            Self::reap_finished(&self.active_tasks).await;
            let active_count = self.active_tasks.read().await.len();
            if active_count == 0 {
                break;
            }

            debug!("Waiting for {} active tasks to complete", active_count);
            sleep(Duration::from_millis(500)).await;
        }

        for (task_id, handle) in self.active_tasks.read().await.iter() {
            warn!("Force stopping task {}", task_id);
            handle.abort();
        }

        info!("Worker {} shut down complete", self.config.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::task::RetryConfig;

    struct Echo;

    #[async_trait::async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, _ctx: &TaskContext, args: &str) -> TaskResult<String> {
            Ok(args.to_string())
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _ctx: &TaskContext, _args: &str) -> TaskResult<String> {
            sleep(Duration::from_secs(5)).await;
            Ok("null".to_string())
        }
    }

    async fn context() -> TaskContext {
        TaskContext::from_config(&AppConfig::testing()).await.unwrap()
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = TaskHandlerRegistry::default();
        registry.register("echo", DEFAULT_QUEUE, Echo).await;

        let registration = registry.find("echo").await.unwrap();
        assert_eq!(registration.queue, "celery_default");
        assert!(registry.find("missing").await.is_none());
        assert_eq!(registry.names().await, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_run_handler_records_success() {
        let ctx = context().await;
        let def =
            TaskDefinition::from_parts("echo", DEFAULT_QUEUE, "[1]".into(), Default::default());

        let result = run_handler(&def, &Echo, &ctx, None).await.unwrap();
        assert_eq!(result, "[1]");
        assert_eq!(ctx.stats.counter("task.echo.success"), 1);
        assert_eq!(ctx.stats.timings("task.echo.duration_ms").len(), 1);
    }

    #[tokio::test]
    async fn test_run_handler_times_out() {
        let ctx = context().await;
        let def =
            TaskDefinition::from_parts("slow", DEFAULT_QUEUE, "null".into(), Default::default());

        let result = run_handler(&def, &Slow, &ctx, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(TaskError::Timeout { .. })));
        assert_eq!(ctx.stats.counter("task.slow.failure"), 1);
    }

    fn retrying_def(max_retries: u32) -> TaskDefinition {
        TaskDefinition::from_parts(
            "upload",
            DEFAULT_QUEUE,
            "[]".into(),
            RetryConfig::with_retries(max_retries),
        )
    }

    #[test]
    fn test_failure_action_retries_recoverable_errors() {
        let config = WorkerConfig::default();
        let def = retrying_def(2);
        let error = TaskError::cache("set", "connection reset");

        assert_eq!(failure_action(&config, &def, &error), FailureAction::Retry);
    }

    #[test]
    fn test_failure_action_without_auto_retry() {
        let config = WorkerConfig {
            auto_retry: false,
            ..WorkerConfig::default()
        };
        let def = retrying_def(2);
        let error = TaskError::cache("set", "connection reset");

        assert_eq!(failure_action(&config, &def, &error), FailureAction::Fail);
    }

    #[test]
    fn test_failure_action_never_retries_bad_input() {
        let config = WorkerConfig::default();
        let def = retrying_def(2);

        let error = TaskError::invalid_key("user id \"jürgen\" is not ASCII");
        assert_eq!(failure_action(&config, &def, &error), FailureAction::Fail);

        let error = TaskError::from(serde_json::from_str::<u8>("x").unwrap_err());
        assert_eq!(failure_action(&config, &def, &error), FailureAction::Fail);
    }

    #[test]
    fn test_failure_action_stops_when_retries_run_out() {
        let config = WorkerConfig::default();
        let error = TaskError::task_execution("fail");

        let mut def = retrying_def(1);
        assert_eq!(failure_action(&config, &def, &error), FailureAction::Retry);

        def.mark_retry("fail").unwrap();
        assert_eq!(failure_action(&config, &def, &error), FailureAction::Fail);

        // Tasks that never opted in fail on the first error
        assert_eq!(
            failure_action(&config, &retrying_def(0), &error),
            FailureAction::Fail
        );
    }

    #[test]
    fn test_worker_stats_average() {
        let mut stats = WorkerStats::default();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.tasks_processed, 2);
        assert!((stats.average_execution_time_ms - 20.0).abs() < f64::EPSILON);
    }
}
