//! Redis-backed `CacheClient` (spec §4.A).
//!
//! Generalizes the teacher's single-multiplexed-connection `L2Cache::new`
//! (`l2_cache.rs`) into a small `bb8` pool and adds the retry-once-then-`Unavailable`
//! semantics spec §4.A calls for: every operation below checks out a pooled
//! connection, and on a connection-level failure checks out a second one before
//! giving up.

use super::CacheClient;
use crate::error::{CoreError, CoreResult};
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

/// Pooled, retry-once wrapper over a `redis`-compatible backend.
#[derive(Clone)]
pub struct RedisCacheClient {
    pool: Pool<RedisConnectionManager>,
}

impl RedisCacheClient {
    /// Connects a small pool (default 4 connections, matching spec §4.A) to `redis_url`.
    pub async fn connect(redis_url: &str, pool_size: u32) -> CoreResult<Self> {
        let manager = RedisConnectionManager::new(redis_url)
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Runs `op` against a pooled connection, retrying once against a fresh
    /// connection on failure before surfacing [`CoreError::Unavailable`].
    async fn with_retry<T, F, Fut>(&self, op: F) -> CoreResult<T>
    where
        F: Fn(bb8::PooledConnection<'_, RedisConnectionManager>) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        for _attempt in 0..2 {
            match self.pool.get().await {
                Ok(conn) => match op(conn).await {
                    Ok(v) => return Ok(v),
                    Err(_e) => continue,
                },
                Err(_e) => continue,
            }
        }
        Err(CoreError::Unavailable(
            "redis connection unavailable after retry".to_string(),
        ))
    }
}

impl CacheClient for RedisCacheClient {
    async fn del(&self, key: &str) -> CoreResult<()> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.del::<_, ()>(key).await }
        })
        .await
    }

    async fn expire(&self, key: &str, seconds: u64) -> CoreResult<()> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.expire::<_, ()>(key, seconds as i64).await }
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        let (key, member) = (key.to_string(), member.to_string());
        self.with_retry(|mut c| {
            let (key, member) = (key.clone(), member.clone());
            async move { c.sadd::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn sismember(&self, key: &str, member: &str) -> CoreResult<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.with_retry(|mut c| {
            let (key, member) = (key.clone(), member.clone());
            async move { c.sismember(key, member).await }
        })
        .await
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.smembers(key).await }
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CoreResult<()> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.with_retry(|mut c| {
            let (key, field, value) = (key.clone(), field.clone(), value.clone());
            async move { c.hset::<_, _, _, ()>(key, field, value).await }
        })
        .await
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> CoreResult<bool> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.with_retry(|mut c| {
            let (key, field, value) = (key.clone(), field.clone(), value.clone());
            async move { c.hset_nx(key, field, value).await }
        })
        .await
    }

    async fn hmset(&self, key: &str, fields: &[(&str, &str)]) -> CoreResult<()> {
        let key = key.to_string();
        let owned: Vec<(String, String)> = fields
            .iter()
            .map(|(f, v)| ((*f).to_string(), (*v).to_string()))
            .collect();
        self.with_retry(|mut c| {
            let key = key.clone();
            let owned = owned.clone();
            async move { c.hset_multiple::<_, _, _, ()>(key, &owned).await }
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        self.with_retry(|mut c| {
            let (key, field) = (key.clone(), field.clone());
            async move { c.hget(key, field).await }
        })
        .await
    }

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.hgetall(key).await }
        })
        .await
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> CoreResult<i64> {
        let (key, field) = (key.to_string(), field.to_string());
        self.with_retry(|mut c| {
            let (key, field) = (key.clone(), field.clone());
            async move { c.hincr(key, field, delta).await }
        })
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> CoreResult<()> {
        let (key, field) = (key.to_string(), field.to_string());
        self.with_retry(|mut c| {
            let (key, field) = (key.clone(), field.clone());
            async move { c.hdel::<_, _, ()>(key, field).await }
        })
        .await
    }

    async fn hexists(&self, key: &str, field: &str) -> CoreResult<bool> {
        let (key, field) = (key.to_string(), field.to_string());
        self.with_retry(|mut c| {
            let (key, field) = (key.clone(), field.clone());
            async move { c.hexists(key, field).await }
        })
        .await
    }

    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.get(key).await }
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> CoreResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_retry(|mut c| {
            let (key, value) = (key.clone(), value.clone());
            async move { c.set_ex::<_, _, ()>(key, value, ttl_secs).await }
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str) -> CoreResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_retry(|mut c| {
            let (key, value) = (key.clone(), value.clone());
            async move { c.set_nx(key, value).await }
        })
        .await
    }

    async fn set_ex_nx(&self, key: &str, value: &str, ttl_secs: u64) -> CoreResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_retry(|mut c| {
            let (key, value) = (key.clone(), value.clone());
            async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async::<Option<String>>(&mut *c)
                    .await
                    .map(|v| v.is_some())
            }
        })
        .await
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.incr(key, 1).await }
        })
        .await
    }

    async fn lpush(&self, key: &str, value: &str) -> CoreResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_retry(|mut c| {
            let (key, value) = (key.clone(), value.clone());
            async move { c.lpush::<_, _, ()>(key, value).await }
        })
        .await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CoreResult<Vec<String>> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.lrange(key, start as isize, stop as isize).await }
        })
        .await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> CoreResult<()> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.ltrim::<_, ()>(key, start as isize, stop as isize).await }
        })
        .await
    }

    async fn llen(&self, key: &str) -> CoreResult<usize> {
        let key = key.to_string();
        self.with_retry(|mut c| {
            let key = key.clone();
            async move { c.llen(key).await }
        })
        .await
    }
}
