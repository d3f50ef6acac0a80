//! Cache client (spec §4.A) — a typed wrapper over a Redis-compatible store.
//!
//! Generalizes the teacher's `L2Cache`
//! (`service_islands/layer1_infrastructure/cache_system_island/l2_cache.rs`), which held a
//! single multiplexed connection, into the pooled, retry-once client the coordination
//! core needs: every other subsystem (instance context, counters, timers, registry,
//! model store) is generic over `CacheClient` so the same code runs against Redis in
//! production and against the in-memory mock in tests.

pub mod keys;
pub mod mock;
pub mod redis_client;

use crate::error::CoreResult;
use std::collections::HashMap;

pub use keys::CacheKeys;
pub use mock::InMemoryCacheClient;
pub use redis_client::RedisCacheClient;

/// Typed operations over a Redis-compatible backend (spec §4.A).
///
/// Integer-valued fields are encoded as decimal strings on the wire and parsed back;
/// a type mismatch is a hard error surfaced as [`crate::error::CoreError::SystemError`].
#[allow(async_fn_in_trait)]
pub trait CacheClient: Clone + Send + Sync + 'static {
    async fn del(&self, key: &str) -> CoreResult<()>;
    async fn expire(&self, key: &str, seconds: u64) -> CoreResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()>;
    async fn sismember(&self, key: &str, member: &str) -> CoreResult<bool>;
    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> CoreResult<()>;
    /// Returns `true` if the field was newly set, `false` if it already existed.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> CoreResult<bool>;
    async fn hmset(&self, key: &str, fields: &[(&str, &str)]) -> CoreResult<()>;
    async fn hget(&self, key: &str, field: &str) -> CoreResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>>;
    /// Atomic `HINCRBY`, returns the value after the increment.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> CoreResult<i64>;
    async fn hdel(&self, key: &str, field: &str) -> CoreResult<()>;
    async fn hexists(&self, key: &str, field: &str) -> CoreResult<bool>;

    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> CoreResult<()>;
    /// Returns `true` if the key was newly set.
    async fn set_nx(&self, key: &str, value: &str) -> CoreResult<bool>;
    /// `SetExNx` — the primitive used to elect the writer of a globally unique record
    /// (instance name, summary lock, server registration lock). Returns `true` if this
    /// call won the election.
    async fn set_ex_nx(&self, key: &str, value: &str, ttl_secs: u64) -> CoreResult<bool>;
    async fn incr(&self, key: &str) -> CoreResult<i64>;

    async fn lpush(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CoreResult<Vec<String>>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> CoreResult<()>;
    async fn llen(&self, key: &str) -> CoreResult<usize>;
}
