//! In-memory `CacheClient` used by unit and scenario tests.
//!
//! Lets the scenario tests in `tests/` exercise multiple `Service` instances
//! "sharing a cache" without a running Redis, matching spec §8's requirement
//! that the end-to-end scenarios be deterministic given mock transports.

use super::CacheClient;
use crate::error::CoreResult;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Store {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    lists: HashMap<String, Vec<String>>,
}

/// Shared, clonable in-memory stand-in for a Redis-compatible backend.
///
/// TTLs are accepted but not enforced — nothing in the test scenarios depends on
/// wall-clock expiry of cache rows.
#[derive(Clone, Default)]
pub struct InMemoryCacheClient {
    inner: Arc<parking_lot::Mutex<Store>>,
}

impl InMemoryCacheClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheClient for InMemoryCacheClient {
    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut s = self.inner.lock();
        s.strings.remove(key);
        s.hashes.remove(key);
        s.sets.remove(key);
        s.lists.remove(key);
        Ok(())
    }

    async fn expire(&self, _key: &str, _seconds: u64) -> CoreResult<()> {
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        self.inner
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> CoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .is_some_and(|s| s.contains(member)))
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CoreResult<()> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> CoreResult<bool> {
        let mut s = self.inner.lock();
        let h = s.hashes.entry(key.to_string()).or_default();
        if h.contains_key(field) {
            Ok(false)
        } else {
            h.insert(field.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn hmset(&self, key: &str, fields: &[(&str, &str)]) -> CoreResult<()> {
        let mut s = self.inner.lock();
        let h = s.hashes.entry(key.to_string()).or_default();
        for (f, v) in fields {
            h.insert((*f).to_string(), (*v).to_string());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> CoreResult<i64> {
        let mut s = self.inner.lock();
        let h = s.hashes.entry(key.to_string()).or_default();
        let cur = h
            .get(field)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| crate::error::CoreError::SystemError(e.to_string()))?
            .unwrap_or(0);
        let new_val = cur + delta;
        h.insert(field.to_string(), new_val.to_string());
        Ok(new_val)
    }

    async fn hdel(&self, key: &str, field: &str) -> CoreResult<()> {
        if let Some(h) = self.inner.lock().hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hexists(&self, key: &str, field: &str) -> CoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> CoreResult<()> {
        self.inner.lock().strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> CoreResult<bool> {
        let mut s = self.inner.lock();
        if s.strings.contains_key(key) {
            Ok(false)
        } else {
            s.strings.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn set_ex_nx(&self, key: &str, value: &str, _ttl_secs: u64) -> CoreResult<bool> {
        self.set_nx(key, value).await
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let mut s = self.inner.lock();
        let cur = s
            .strings
            .get(key)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|e| crate::error::CoreError::SystemError(e.to_string()))?
            .unwrap_or(0);
        let new_val = cur + 1;
        s.strings.insert(key.to_string(), new_val.to_string());
        Ok(new_val)
    }

    async fn lpush(&self, key: &str, value: &str) -> CoreResult<()> {
        self.inner
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CoreResult<Vec<String>> {
        let s = self.inner.lock();
        let Some(list) = s.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let (start, stop) = (norm(start), norm(stop));
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=(stop.min(len - 1)) as usize].to_vec())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> CoreResult<()> {
        let trimmed = self.lrange(key, start, stop).await?;
        self.inner.lock().lists.insert(key.to_string(), trimmed);
        Ok(())
    }

    async fn llen(&self, key: &str) -> CoreResult<usize> {
        Ok(self.inner.lock().lists.get(key).map_or(0, Vec::len))
    }
}
