//! Cache tasks keyed by user

use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

use crate::app::WorkerApp;
use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};
use crate::json;
use crate::task::Task;

/// Lifetime of an uploaded record, in seconds
pub const UPLOAD_TTL: u64 = 3600;

/// Counter bumped by the `dummy` task
pub const DUMMY_KEY: &[u8] = b"foo";

/// Caller-supplied user identifier. Any JSON scalar is accepted and
/// rendered the way Python's `str()` would render it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Render a JSON scalar as a user id. Arrays and objects are rejected.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(text) => Ok(UserId(text.clone())),
            Value::Bool(true) => Ok(UserId("True".to_string())),
            Value::Bool(false) => Ok(UserId("False".to_string())),
            Value::Null => Ok(UserId("None".to_string())),
            Value::Number(number) => python_number(number).map(UserId),
            Value::Array(_) | Value::Object(_) => {
                Err(format!("user id must be a JSON scalar, got {}", value))
            }
        }
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        UserId::from_value(&value).map_err(de::Error::custom)
    }
}

// Integers keep every digit; floats follow Python's repr.
fn python_number(number: &Number) -> Result<String, String> {
    let text = number.to_string();
    if !text.contains(['.', 'e', 'E']) {
        let digits = text.trim_start_matches('-');
        if digits.bytes().all(|b| b == b'0') {
            return Ok("0".to_string());
        }
        return Ok(text);
    }

    let float: f64 = text
        .parse()
        .map_err(|_| format!("user id {} is not a number", text))?;
    if !float.is_finite() {
        return Ok(if float > 0.0 { "inf" } else { "-inf" }.to_string());
    }
    Ok(python_float_repr(float))
}

fn python_float_repr(float: f64) -> String {
    // Shortest round-trip digits, e.g. "1.5e0" or "-1e20"
    let sci = format!("{:e}", float);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if (-4..16).contains(&exponent) {
        let point = exponent + 1;
        let body = if point <= 0 {
            format!("0.{}{}", "0".repeat((-point) as usize), digits)
        } else if point as usize >= digits.len() {
            format!("{}{}.0", digits, "0".repeat(point as usize - digits.len()))
        } else {
            let (whole, frac) = digits.split_at(point as usize);
            format!("{}.{}", whole, frac)
        };
        format!("{}{}", sign, body)
    } else {
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        format!("{}{}e{}{:02}", sign, mantissa, exp_sign, exponent.abs())
    }
}

impl From<&str> for UserId {
    fn from(user: &str) -> Self {
        UserId(user.to_string())
    }
}

impl From<String> for UserId {
    fn from(user: String) -> Self {
        UserId(user)
    }
}

impl From<i64> for UserId {
    fn from(user: i64) -> Self {
        UserId(user.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache key for a user: the ASCII bytes of `user_<id>`.
pub fn user_key(user: &UserId) -> TaskResult<Vec<u8>> {
    let key = format!("user_{}", user);
    if !key.is_ascii() {
        return Err(TaskError::invalid_key(format!(
            "user id {:?} is not ASCII",
            user.0
        )));
    }
    Ok(key.into_bytes())
}

/// Remove a user's cached record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delete {
    pub user: UserId,
}

#[async_trait]
impl Task for Delete {
    const NAME: &'static str = "delete";
    type Output = ();

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let key = user_key(&self.user)?;
        ctx.cache.delete(&key).await
    }
}

/// Store a user's payload as JSON for [`UPLOAD_TTL`] seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub user: UserId,
    pub data: Value,
}

#[async_trait]
impl Task for Upload {
    const NAME: &'static str = "upload";
    type Output = ();

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let key = user_key(&self.user)?;
        let payload = json::dumps(&self.data)?;
        ctx.cache
            .set(&key, payload.as_bytes(), Some(UPLOAD_TTL))
            .await
    }
}

/// Test-only: add 2 to the `foo` counter and return the new value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dummy {}

#[async_trait]
impl Task for Dummy {
    const NAME: &'static str = "dummy";
    type Output = i64;

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<i64> {
        ctx.cache.incr(DUMMY_KEY, 2).await?;
        let raw = ctx
            .cache
            .get(DUMMY_KEY)
            .await?
            .ok_or_else(|| TaskError::task_execution("counter vanished after incr"))?;

        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| TaskError::task_execution("counter is not an integer"))
    }
}

/// Test-only: always fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {}

#[async_trait]
impl Task for Fail {
    const NAME: &'static str = "error";
    type Output = ();

    async fn execute(&self, _ctx: &TaskContext) -> TaskResult<()> {
        Err(TaskError::task_execution("fail"))
    }
}

/// Register the cache tasks on `app`. `dummy` and `error` are only
/// registered when the app is configured for testing.
pub async fn register_tasks(app: &WorkerApp) {
    app.register::<Delete>().await;
    app.register::<Upload>().await;

    if app.conf().testing {
        app.register::<Dummy>().await;
        app.register::<Fail>().await;
    }
}
