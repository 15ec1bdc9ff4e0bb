//! Execution context handed to every task handler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::cache::{self, Cache};
use crate::config::AppConfig;
use crate::error::TaskResult;
use crate::task::TaskDefinition;

/// Helpers a handler may use: the cache, the storage bucket, the error
/// reporter and the metrics client.
#[derive(Clone)]
pub struct TaskContext {
    pub cache: Arc<dyn Cache>,
    pub bucket: Bucket,
    pub error_reporter: Arc<dyn ErrorReporter>,
    pub stats: Arc<Stats>,
}

impl TaskContext {
    pub fn new(
        cache: Arc<dyn Cache>,
        bucket: Bucket,
        error_reporter: Arc<dyn ErrorReporter>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            cache,
            bucket,
            error_reporter,
            stats,
        }
    }

    /// Build the default context for `config`, connecting to its cache.
    pub async fn from_config(config: &AppConfig) -> TaskResult<Self> {
        let cache = cache::connect(&config.cache_url).await?;
        Ok(Self::new(
            cache,
            Bucket::new(&config.bucket),
            Arc::new(LogReporter::new()),
            Arc::new(Stats::new(&config.stats_prefix)),
        ))
    }

    /// Record a failed task with the error reporter and in stats.
    pub fn report_failure(&self, task_def: &TaskDefinition, message: &str) {
        self.stats.incr(&format!("task.{}.failure", task_def.name), 1);
        self.error_reporter.capture(FailureReport {
            task_id: task_def.id.to_string(),
            task_name: task_def.name.clone(),
            queue: task_def.queue.clone(),
            message: message.to_string(),
            occurred_at: Utc::now(),
        });
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("bucket", &self.bucket)
            .field("stats", &self.stats.prefix)
            .finish_non_exhaustive()
    }
}

/// Storage bucket handlers may write to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
}

impl Bucket {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// A task failure as seen by the error reporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub task_id: String,
    pub task_name: String,
    pub queue: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Sink for task failures
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, report: FailureReport);
}

/// Reporter that logs each failure and keeps it for later inspection
#[derive(Debug, Default)]
pub struct LogReporter {
    reports: Mutex<Vec<FailureReport>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<FailureReport> {
        lock(&self.reports).clone()
    }
}

impl ErrorReporter for LogReporter {
    fn capture(&self, report: FailureReport) {
        error!(
            task_id = %report.task_id,
            task = %report.task_name,
            queue = %report.queue,
            "Task failed: {}",
            report.message
        );
        lock(&self.reports).push(report);
    }
}

/// Named counters and timings, prefixed with the service name
#[derive(Debug, Default)]
pub struct Stats {
    prefix: String,
    counters: Mutex<HashMap<String, i64>>,
    timings: Mutex<HashMap<String, Vec<u64>>>,
}

impl Stats {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Self::default()
        }
    }

    fn metric_name(&self, metric: &str) -> String {
        if self.prefix.is_empty() {
            metric.to_string()
        } else {
            format!("{}.{}", self.prefix, metric)
        }
    }

    pub fn incr(&self, metric: &str, value: i64) {
        let name = self.metric_name(metric);
        debug!(metric = %name, value, "stats incr");
        *lock(&self.counters).entry(name).or_insert(0) += value;
    }

    pub fn timing(&self, metric: &str, millis: u64) {
        let name = self.metric_name(metric);
        debug!(metric = %name, millis, "stats timing");
        lock(&self.timings).entry(name).or_default().push(millis);
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn counter(&self, metric: &str) -> i64 {
        let name = self.metric_name(metric);
        lock(&self.counters).get(&name).copied().unwrap_or(0)
    }

    pub fn timings(&self, metric: &str) -> Vec<u64> {
        let name = self.metric_name(metric);
        lock(&self.timings).get(&name).cloned().unwrap_or_default()
    }
}

// A panic while holding one of these locks leaves the data usable
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
