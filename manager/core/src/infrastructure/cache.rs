// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cache Client
//!
//! Key/value and list access to the shared Redis instance. The manager uses
//! it for the ETag change channel and for small cached objects.
//!
//! Two implementations sit behind [`CacheClient`]:
//! - [`RedisCache`] pools connections with `bb8-redis`
//! - [`InMemoryCache`] keeps everything in process for tests and local mode
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Cache port and its adapters

use crate::domain::error::{codes, AxError, AxResult};
use async_trait::async_trait;
use bb8_redis::bb8::Pool;
use bb8_redis::redis::{self, RedisError};
use bb8_redis::RedisConnectionManager;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Per-operation budget for cache calls.
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Returns `""` when the key is missing.
    async fn get_string(&self, key: &str) -> AxResult<String>;

    async fn set(&self, key: &str, value: &str) -> AxResult<()> {
        self.set_with_ttl(key, value, 0).await
    }

    /// `ttl_secs == 0` means no expiry.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AxResult<()>;

    async fn del(&self, keys: &[&str]) -> AxResult<()>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> AxResult<()>;

    async fn rpush(&self, key: &str, values: &[String]) -> AxResult<()>;

    /// Blocking right pop across `keys`. `Ok(None)` when `timeout` elapses.
    async fn brpop(&self, timeout: Duration, keys: &[&str]) -> AxResult<Option<(String, String)>>;

    async fn flush_db(&self) -> AxResult<()>;
}

/// JSON object helpers layered over any [`CacheClient`].
#[async_trait]
pub trait CacheObjectExt: CacheClient {
    async fn get_obj<T>(&self, key: &str) -> AxResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let raw = self.get_string(key).await?;
        if raw.is_empty() {
            return Err(AxError::new(
                codes::ERR_CACHE_NOT_FOUND,
                format!("cache key {} not found", key),
            ));
        }
        Ok(serde_json::from_str(&raw)?)
    }

    async fn set_obj<T>(&self, key: &str, value: &T) -> AxResult<()>
    where
        T: Serialize + Sync,
    {
        self.set_obj_with_ttl(key, value, 0).await
    }

    async fn set_obj_with_ttl<T>(&self, key: &str, value: &T, ttl_secs: u64) -> AxResult<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set_with_ttl(key, &raw, ttl_secs).await
    }
}

impl<C: CacheClient + ?Sized> CacheObjectExt for C {}

// ============================================================================
// Redis
// ============================================================================

pub struct RedisCache {
    pool: Pool<RedisConnectionManager>,
}

pub(crate) fn redis_error(err: RedisError) -> AxError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        AxError::from_cause(err, codes::ERR_AX_HTTP_CONNECTION, "redis connection failed")
    } else if err.is_timeout() {
        AxError::from_cause(err, codes::ERR_TIMEOUT, "redis operation timed out")
    } else {
        AxError::from_cause(err, codes::ERR_INTERNAL, "redis operation failed")
    }
}

impl RedisCache {
    pub async fn connect(url: &str) -> AxResult<Self> {
        let manager = RedisConnectionManager::new(url).map_err(redis_error)?;
        let pool = Pool::builder()
            .connection_timeout(CACHE_TIMEOUT)
            .build(manager)
            .await
            .map_err(redis_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<RedisConnectionManager> {
        &self.pool
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd, budget: Duration) -> AxResult<T> {
        redis_query(&self.pool, cmd, budget).await
    }
}

/// Run one command on a pooled connection within `budget`.
pub(crate) async fn redis_query<T: redis::FromRedisValue>(
    pool: &Pool<RedisConnectionManager>,
    cmd: redis::Cmd,
    budget: Duration,
) -> AxResult<T> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| AxError::connection(format!("redis pool unavailable: {}", e)))?;
    tokio::time::timeout(budget, cmd.query_async(&mut *conn))
        .await
        .map_err(|_| AxError::timeout("redis operation timed out"))?
        .map_err(redis_error)
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get_string(&self, key: &str) -> AxResult<String> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<String> = self.query(cmd, CACHE_TIMEOUT).await?;
        Ok(value.unwrap_or_default())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AxResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_secs > 0 {
            cmd.arg("EX").arg(ttl_secs);
        }
        self.query::<()>(cmd, CACHE_TIMEOUT).await
    }

    async fn del(&self, keys: &[&str]) -> AxResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.query::<i64>(cmd, CACHE_TIMEOUT).await.map(|_| ())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> AxResult<()> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs);
        self.query::<i64>(cmd, CACHE_TIMEOUT).await.map(|_| ())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> AxResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(values);
        self.query::<i64>(cmd, CACHE_TIMEOUT).await.map(|_| ())
    }

    async fn brpop(&self, timeout: Duration, keys: &[&str]) -> AxResult<Option<(String, String)>> {
        // BRPOP treats 0 as "block forever".
        let secs = timeout.as_secs().max(1);
        let mut cmd = redis::cmd("BRPOP");
        cmd.arg(keys).arg(secs);
        self.query(cmd, timeout + CACHE_TIMEOUT).await
    }

    async fn flush_db(&self) -> AxResult<()> {
        self.query::<()>(redis::cmd("FLUSHDB"), CACHE_TIMEOUT).await
    }
}

// ============================================================================
// In-memory
// ============================================================================

enum Slot {
    Text(String),
    List(VecDeque<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Notify,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop_any(&self, keys: &[&str]) -> Option<(String, String)> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for key in keys {
            if entries.get(*key).map(|e| e.expired(now)).unwrap_or(false) {
                entries.remove(*key);
                continue;
            }
            if let Some(Entry { slot: Slot::List(list), .. }) = entries.get_mut(*key) {
                if let Some(value) = list.pop_back() {
                    if list.is_empty() {
                        entries.remove(*key);
                    }
                    return Some((key.to_string(), value));
                }
            }
        }
        None
    }
}

fn wrong_type(key: &str) -> AxError {
    AxError::internal(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl CacheClient for InMemoryCache {
    async fn get_string(&self, key: &str) -> AxResult<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.expired(now) => {
                entries.remove(key);
                Ok(String::new())
            }
            Some(Entry { slot: Slot::Text(s), .. }) => Ok(s.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(String::new()),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> AxResult<()> {
        let expires_at = (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(ttl_secs));
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[&str]) -> AxResult<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> AxResult<()> {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> AxResult<()> {
        {
            let now = Instant::now();
            let mut entries = self.entries.lock();
            if entries.get(key).map(|e| e.expired(now)).unwrap_or(false) {
                entries.remove(key);
            }
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.slot {
                Slot::List(list) => list.extend(values.iter().cloned()),
                Slot::Text(_) => return Err(wrong_type(key)),
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(&self, timeout: Duration, keys: &[&str]) -> AxResult<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.pop_any(keys) {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("brpop timed out on {:?}", keys);
                return Ok(None);
            }
        }
    }

    async fn flush_db(&self) -> AxResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
