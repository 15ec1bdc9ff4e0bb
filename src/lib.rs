//! # contextgraph worker
//!
//! Background tasks that keep per-user records in a key-value cache, and the
//! small Redis-backed task runtime they run on.
//!
//! ## Tasks
//!
//! - `delete(user)` removes the record under `user_<user>`
//! - `upload(user, data)` stores `data` as JSON under `user_<user>` for one hour
//! - `dummy()` and `error()` exist only when the app is configured for testing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use contextgraph_worker::{register_tasks, AppConfig, TaskClient, WorkerApp};
//! use std::sync::Arc;
//!
//! # async fn run() -> contextgraph_worker::TaskResult<()> {
//! let app = Arc::new(WorkerApp::from_config(AppConfig::from_env()).await?);
//! register_tasks(&app).await;
//!
//! let client = TaskClient::new(app);
//! client.upload("42", &serde_json::json!({"a": 1})).await?;
//! client.delete("42").await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod json;
pub mod queue;
pub mod task;
pub mod tasks;
pub mod worker;

pub use app::WorkerApp;
pub use cache::{Cache, MemoryCache, RedisCache};
pub use client::TaskClient;
pub use config::{AppConfig, DEFAULT_QUEUE};
pub use context::{Bucket, ErrorReporter, LogReporter, Stats, TaskContext};
pub use error::{TaskError, TaskResult};
pub use queue::TaskQueue;
pub use task::{RetryConfig, Task, TaskDefinition, TaskId, TaskStatus};
pub use tasks::{register_tasks, user_key, UserId};
pub use worker::{Worker, WorkerConfig};

/// Version of the worker crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
