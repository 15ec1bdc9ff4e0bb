//! Key-value cache used by task handlers
//!
//! Two backends share the [`Cache`] trait: [`RedisCache`] for deployments and
//! [`MemoryCache`] for eager mode and tests. Keys and values are raw bytes.

use async_trait::async_trait;
use redis::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{TaskError, TaskResult};

/// Cache operations available to handlers
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a value, `None` when absent or expired.
    async fn get(&self, key: &[u8]) -> TaskResult<Option<Vec<u8>>>;

    /// Set a value, replacing any prior one. `ex` is the expiration in seconds.
    async fn set(&self, key: &[u8], value: &[u8], ex: Option<u64>) -> TaskResult<()>;

    /// Atomically add `amount` to an integer value, treating a missing key as 0.
    async fn incr(&self, key: &[u8], amount: i64) -> TaskResult<i64>;

    /// Remove a key. Removing a missing key succeeds.
    async fn delete(&self, key: &[u8]) -> TaskResult<()>;

    /// Remaining time to live in seconds, `None` when absent or persistent.
    async fn ttl(&self, key: &[u8]) -> TaskResult<Option<u64>>;
}

/// Open the cache named by `url`: `memory://` or a redis URL.
pub async fn connect(url: &str) -> TaskResult<Arc<dyn Cache>> {
    if url.starts_with("memory://") {
        info!("Using in-memory cache");
        return Ok(Arc::new(MemoryCache::new()));
    }
    Ok(Arc::new(RedisCache::new(url).await?))
}

/// Redis-backed cache
#[derive(Debug, Clone)]
pub struct RedisCache {
    client: Client,
}

impl RedisCache {
    pub async fn new(url: &str) -> TaskResult<Self> {
        let client =
            Client::open(url).map_err(|e| TaskError::cache("connect", e.to_string()))?;

        let mut conn = client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::cache("connect", e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::cache("ping", e.to_string()))?;

        info!("Connected to cache at {}", url);
        Ok(Self { client })
    }

    async fn get_connection(&self) -> TaskResult<redis::aio::Connection> {
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &[u8]) -> TaskResult<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &[u8], value: &[u8], ex: Option<u64>) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(seconds) = ex {
            cmd.arg("EX").arg(seconds);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &[u8], amount: i64) -> TaskResult<i64> {
        let mut conn = self.get_connection().await?;
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(amount)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &[u8]) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        debug!("DEL removed {} key(s)", removed);
        Ok(())
    }

    async fn ttl(&self, key: &[u8]) -> TaskResult<Option<u64>> {
        let mut conn = self.get_connection().await?;
        // -2: missing, -1: no expiry
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ttl).ok())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Process-local cache with per-key expiry. Expired keys are dropped on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<Vec<u8>, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<Vec<u8>, Entry>,
    key: &[u8],
) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &[u8]) -> TaskResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        Ok(live_entry(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &[u8], value: &[u8], ex: Option<u64>) -> TaskResult<()> {
        let expires_at = ex.map(|seconds| Instant::now() + Duration::from_secs(seconds));
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &[u8], amount: i64) -> TaskResult<i64> {
        let mut entries = self.entries.lock().await;
        let (current, expires_at) = match live_entry(&mut entries, key) {
            Some(entry) => {
                let current = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| TaskError::cache("incr", "value is not an integer"))?;
                (current, entry.expires_at)
            }
            None => (0, None),
        };

        let next = current
            .checked_add(amount)
            .ok_or_else(|| TaskError::cache("incr", "increment would overflow"))?;
        entries.insert(
            key.to_vec(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &[u8]) -> TaskResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &[u8]) -> TaskResult<Option<u64>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(live_entry(&mut entries, key)
            .and_then(|e| e.expires_at)
            .map(|at| {
                let remaining = at.saturating_duration_since(now);
                remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
            }))
    }
}
