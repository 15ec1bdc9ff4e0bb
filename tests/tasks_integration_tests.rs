//! End-to-end runs of the cache tasks on an eager app with an in-memory cache

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use contextgraph_worker::cache::MemoryCache;
use contextgraph_worker::tasks::{Dummy, Fail, UPLOAD_TTL};
use contextgraph_worker::{
    register_tasks, AppConfig, Bucket, Cache, LogReporter, Stats, TaskClient, TaskContext,
    TaskDefinition, TaskError, TaskStatus, WorkerApp,
};

struct Fixture {
    client: TaskClient,
    cache: Arc<MemoryCache>,
    reporter: Arc<LogReporter>,
    stats: Arc<Stats>,
}

async fn fixture_with(config: AppConfig) -> Fixture {
    let cache = Arc::new(MemoryCache::new());
    let reporter = Arc::new(LogReporter::new());
    let stats = Arc::new(Stats::new("test"));
    let context = TaskContext::new(
        cache.clone(),
        Bucket::new(&config.bucket),
        reporter.clone(),
        stats.clone(),
    );

    let app = WorkerApp::new(config, context).await.unwrap();
    register_tasks(&app).await;

    Fixture {
        client: TaskClient::new(Arc::new(app)),
        cache,
        reporter,
        stats,
    }
}

async fn fixture() -> Fixture {
    fixture_with(AppConfig::testing()).await
}

#[tokio::test]
async fn test_config() {
    let fx = fixture().await;
    let app = fx.client.app();

    assert!(app.conf().always_eager);
    assert!(app.conf().result_backend.contains("redis"));
    assert_eq!(app.context().bucket.name, "contextgraph");
    assert_eq!(app.conf().default_queue, "celery_default");
    assert_eq!(
        app.registered().await,
        vec!["delete", "dummy", "error", "upload"]
    );
}

#[tokio::test]
async fn test_upload_stores_json_with_ttl() {
    let fx = fixture().await;

    let task = assert_ok!(fx.client.upload("42", &json!({"a": 1})).await);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.queue, "celery_default");

    let stored = fx.cache.get(b"user_42").await.unwrap().unwrap();
    assert_eq!(String::from_utf8(stored).unwrap(), r#"{"a": 1}"#);

    let ttl = fx.cache.ttl(b"user_42").await.unwrap().unwrap();
    assert!(ttl > UPLOAD_TTL - 5 && ttl <= UPLOAD_TTL);
}

#[tokio::test]
async fn test_upload_round_trips_payloads() {
    let fx = fixture().await;
    let payloads = [
        json!(null),
        json!("text with ünïcode"),
        json!([1, 2.5, "three"]),
        json!({"nested": {"list": [true, false]}, "n": -3}),
    ];

    for (i, payload) in payloads.iter().enumerate() {
        assert_ok!(fx.client.upload(i as i64, payload).await);
        let key = format!("user_{}", i);
        let stored = fx.cache.get(key.as_bytes()).await.unwrap().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&stored).unwrap();
        assert_eq!(&decoded, payload);
    }
}

#[tokio::test]
async fn test_upload_overwrites() {
    let fx = fixture().await;
    assert_ok!(fx.client.upload("7", &json!({"v": 1})).await);
    assert_ok!(fx.client.upload("7", &json!({"v": 2})).await);

    let stored = fx.cache.get(b"user_7").await.unwrap().unwrap();
    assert_eq!(stored, br#"{"v": 2}"#.to_vec());
}

#[tokio::test]
async fn test_upload_rejects_unserializable_data() {
    let fx = fixture().await;
    let mut data = HashMap::new();
    data.insert((1, 2), "tuple keys are not JSON");

    let err = assert_err!(fx.client.upload("42", &data).await);
    assert!(matches!(err, TaskError::Serialization(_)));
    assert!(fx.cache.is_empty().await);
}

#[tokio::test]
async fn test_upload_then_delete() {
    let fx = fixture().await;
    assert_ok!(fx.client.upload("42", &json!({"a": 1})).await);

    let task = assert_ok!(fx.client.delete("42").await);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(fx.cache.get(b"user_42").await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_missing_user() {
    let fx = fixture().await;
    let task = assert_ok!(fx.client.delete("nobody").await);
    assert_eq!(task.status, TaskStatus::Success);
    assert!(fx.reporter.reports().is_empty());
}

#[tokio::test]
async fn test_non_ascii_user_fails_and_is_reported() {
    let fx = fixture().await;
    let task = assert_ok!(fx.client.upload("jürgen", &json!({})).await);

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("not ASCII"));
    assert_eq!(fx.reporter.reports().len(), 1);
}

#[tokio::test]
async fn test_send_positional_arguments() {
    let fx = fixture().await;
    let def = TaskDefinition::from_parts(
        "upload",
        "",
        r#"[42, {"a": 1}]"#.to_string(),
        Default::default(),
    );

    let task = assert_ok!(fx.client.app().send_task(def).await);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.queue, "celery_default");
    assert_eq!(
        fx.cache.get(b"user_42").await.unwrap(),
        Some(br#"{"a": 1}"#.to_vec())
    );
}

#[tokio::test]
async fn test_dummy_counts_by_two() {
    let fx = fixture().await;

    let first = assert_ok!(fx.client.submit(&Dummy {}).await);
    let value: i64 = assert_ok!(fx.client.wait_for_result(&first, None).await);
    assert_eq!(value, 2);

    let second = assert_ok!(fx.client.submit(&Dummy {}).await);
    let value: i64 = assert_ok!(fx.client.wait_for_result(&second, None).await);
    assert_eq!(value, 4);

    assert_eq!(fx.stats.counter("task.dummy.success"), 2);
}

#[tokio::test]
async fn test_send_no_argument_tasks_by_name() {
    let fx = fixture().await;

    let def = TaskDefinition::from_parts("dummy", "", "[]".to_string(), Default::default());
    let task = assert_ok!(fx.client.app().send_task(def).await);
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.result.as_deref(), Some("2"));

    let def = TaskDefinition::from_parts("error", "", "[]".to_string(), Default::default());
    let task = assert_ok!(fx.client.app().send_task(def).await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Task execution failed: fail"));
}

#[tokio::test]
async fn test_upload_keeps_big_integers() {
    let fx = fixture().await;
    let data: serde_json::Value =
        serde_json::from_str(r#"{"n": 123456789012345678901234567890}"#).unwrap();

    assert_ok!(fx.client.upload("42", &data).await);

    let stored = fx.cache.get(b"user_42").await.unwrap().unwrap();
    assert_eq!(stored, br#"{"n": 123456789012345678901234567890}"#.to_vec());
}

#[tokio::test]
async fn test_scalar_user_ids_build_python_style_keys() {
    let fx = fixture().await;
    let cases = [
        (r#"[1.5, {"a": 1}]"#, "user_1.5"),
        (r#"[true, {"a": 1}]"#, "user_True"),
        (r#"[null, {"a": 1}]"#, "user_None"),
        (r#"[18446744073709551616, {"a": 1}]"#, "user_18446744073709551616"),
    ];

    for (args, key) in cases {
        let def = TaskDefinition::from_parts("upload", "", args.to_string(), Default::default());
        let task = assert_ok!(fx.client.app().send_task(def).await);
        assert_eq!(task.status, TaskStatus::Success, "{}", args);
        assert_eq!(
            fx.cache.get(key.as_bytes()).await.unwrap(),
            Some(br#"{"a": 1}"#.to_vec()),
            "{}",
            key
        );
    }
}

#[tokio::test]
async fn test_container_user_id_fails() {
    let fx = fixture().await;
    let def = TaskDefinition::from_parts("delete", "", "[[1, 2]]".to_string(), Default::default());

    let task = assert_ok!(fx.client.app().send_task(def).await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("JSON scalar"));
}

#[tokio::test]
async fn test_error_is_reported_not_raised() {
    let fx = fixture().await;

    let task = assert_ok!(fx.client.submit(&Fail {}).await);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Task execution failed: fail"));

    let reports = fx.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].task_name, "error");
    assert_eq!(reports[0].queue, "celery_default");
    assert_eq!(fx.stats.counter("task.error.failure"), 1);

    let result = fx.client.wait_for_result::<()>(&task, None).await;
    assert!(matches!(result, Err(TaskError::TaskExecution { .. })));

    // The app keeps working after a failure
    assert_ok!(fx.client.delete("42").await);
}

#[tokio::test]
async fn test_test_only_tasks_absent_outside_testing() {
    let config = AppConfig {
        testing: false,
        ..AppConfig::testing()
    };
    let fx = fixture_with(config).await;

    assert_eq!(fx.client.app().registered().await, vec!["delete", "upload"]);

    let err = assert_err!(fx.client.submit(&Dummy {}).await);
    assert!(matches!(err, TaskError::UnregisteredTask { .. }));
    let err = assert_err!(fx.client.submit(&Fail {}).await);
    assert!(matches!(err, TaskError::UnregisteredTask { .. }));
}

#[tokio::test]
async fn test_concurrent_uploads_last_write_wins() {
    let fx = fixture().await;
    let client = fx.client.clone();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.upload("9", &json!({ "v": i })).await })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let stored = fx.cache.get(b"user_9").await.unwrap().unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    assert!(decoded["v"].as_i64().is_some_and(|v| (0..8).contains(&v)));
}
