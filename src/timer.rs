//! Distributed timer service (spec §4.E) — named timers with an absolute deadline
//! stored in the cache so every server in the instance agrees on when a round times
//! out.
//!
//! Grounded on `timer.cc`/`timer.h` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/common/distributed_cache/`.

use crate::cache::{CacheClient, CacheKeys};
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    NotStarted,
    Started,
    Stopped,
    TimedOut,
}

#[derive(Debug, Clone)]
struct TimerInfo {
    duration_secs: u64,
    state: LocalState,
    timeout_stamp_ms: u64,
}

/// Named timers reconciled against the cache on every tick.
pub struct Timer<C: CacheClient> {
    cache: C,
    fl_name: String,
    map: Mutex<HashMap<String, TimerInfo>>,
    ttl_secs: std::sync::atomic::AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<C: CacheClient> Timer<C> {
    #[must_use]
    pub fn new(cache: C, fl_name: impl Into<String>, global_iteration_time_window_ms: u64) -> Self {
        Self {
            cache,
            fl_name: fl_name.into(),
            map: Mutex::new(HashMap::new()),
            ttl_secs: std::sync::atomic::AtomicU64::new(iteration_ttl_secs(global_iteration_time_window_ms)),
        }
    }

    /// `SyncPeriod` (SPEC_FULL §B): re-derives the timer-hash TTL whenever
    /// `global_iteration_time_window` changes via a hyper-params update.
    pub fn set_global_iteration_time_window(&self, window_ms: u64) {
        self.ttl_secs
            .store(iteration_ttl_secs(window_ms), std::sync::atomic::Ordering::Relaxed);
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl_secs.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn keys(&self, instance_name: &str) -> CacheKeys {
        CacheKeys::new(&self.fl_name, instance_name)
    }

    /// `RegisterTimer` (spec §4.E).
    pub fn register(&self, name: impl Into<String>, duration_secs: u64) {
        let name = name.into();
        let mut map = self.map.lock();
        if map.contains_key(&name) {
            tracing::warn!(timer = %name, "timer already registered");
            return;
        }
        map.insert(
            name,
            TimerInfo {
                duration_secs,
                state: LocalState::NotStarted,
                timeout_stamp_ms: 0,
            },
        );
    }

    /// `ReinitTimer` (SPEC_FULL §B).
    pub fn reinit(&self, name: &str, duration_secs: u64) {
        if let Some(info) = self.map.lock().get_mut(name) {
            info.duration_secs = duration_secs;
        }
    }

    pub fn reset_on_new_iteration(&self) {
        for info in self.map.lock().values_mut() {
            info.state = LocalState::NotStarted;
            info.timeout_stamp_ms = 0;
        }
    }

    /// `StartTimer` (spec §4.E): the winner's deadline is adopted if the field
    /// already exists in the cache.
    pub async fn start(&self, instance_name: &str, name: &str) -> CoreResult<()> {
        let keys = self.keys(instance_name);
        let deadline = {
            let map = self.map.lock();
            let Some(info) = map.get(name) else {
                tracing::warn!(timer = %name, "start() on unregistered timer");
                return Ok(());
            };
            if info.state != LocalState::NotStarted {
                return Ok(());
            }
            now_ms() + info.duration_secs * 1000
        };

        let timer_hash = keys.timer_hash();
        let won = self.cache.hsetnx(&timer_hash, name, &deadline.to_string()).await?;
        let adopted = if won {
            deadline
        } else {
            self.cache
                .hget(&timer_hash, name)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(deadline)
        };
        self.cache.expire(&timer_hash, self.ttl_secs()).await?;

        let mut map = self.map.lock();
        if let Some(info) = map.get_mut(name) {
            info.state = LocalState::Started;
            info.timeout_stamp_ms = adopted;
        }
        Ok(())
    }

    /// `StopTimer` (spec §4.E): writes `0` into the cache field.
    pub async fn stop(&self, instance_name: &str, name: &str) -> CoreResult<()> {
        {
            let mut map = self.map.lock();
            let Some(info) = map.get_mut(name) else {
                return Ok(());
            };
            info.state = LocalState::Stopped;
            info.timeout_stamp_ms = 0;
        }
        let keys = self.keys(instance_name);
        self.cache.hset(&keys.timer_hash(), name, "0").await
    }

    /// `Sync` (spec §4.E): reconciles local and cache state, firing the timeout
    /// callback (via the returned list) at most once per iteration per timer.
    pub async fn sync(&self, instance_name: &str) -> CoreResult<Vec<String>> {
        let keys = self.keys(instance_name);
        let timer_hash = keys.timer_hash();
        let cache_map = self.cache.hgetall(&timer_hash).await?;
        let now = now_ms();

        let mut fired = Vec::new();
        let mut to_write: Vec<(String, String)> = Vec::new();

        let mut map = self.map.lock();
        for (name, info) in map.iter_mut() {
            if info.state == LocalState::Started && now >= info.timeout_stamp_ms {
                info.state = LocalState::TimedOut;
                fired.push(name.clone());
            }

            let cache_entry = cache_map.get(name).and_then(|v| v.parse::<u64>().ok());
            match cache_entry {
                None => {
                    if info.state != LocalState::NotStarted {
                        to_write.push((name.clone(), info.timeout_stamp_ms.to_string()));
                    }
                }
                Some(0) => {
                    if info.state != LocalState::Stopped {
                        info.state = LocalState::Stopped;
                        info.timeout_stamp_ms = 0;
                    }
                }
                Some(stamp) => {
                    if now >= stamp {
                        if info.state != LocalState::TimedOut {
                            info.state = LocalState::TimedOut;
                            info.timeout_stamp_ms = stamp;
                            if !fired.contains(name) {
                                fired.push(name.clone());
                            }
                        }
                    } else if info.state == LocalState::NotStarted {
                        info.state = LocalState::Started;
                        info.timeout_stamp_ms = stamp;
                    }
                }
            }
        }
        drop(map);

        for (name, stamp) in to_write {
            self.cache.hset(&timer_hash, &name, &stamp).await?;
        }
        Ok(fired)
    }
}

/// `global_iteration_time_window` (ms) plus a 30 minute grace period, matching
/// `counter.rs`'s TTL derivation.
fn iteration_ttl_secs(global_iteration_time_window_ms: u64) -> u64 {
    global_iteration_time_window_ms / 1000 + 30 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;

    #[tokio::test]
    async fn start_is_idempotent_and_second_timer_adopts_first_deadline() {
        let cache = InMemoryCacheClient::new();
        let a = Timer::new(cache.clone(), "lenet", 3_600_000);
        let b = Timer::new(cache, "lenet", 3_600_000);
        a.register("updateModel", 10);
        b.register("updateModel", 999);
        a.start("i_1", "updateModel").await.unwrap();
        b.start("i_1", "updateModel").await.unwrap();

        let a_map = a.map.lock();
        let b_map = b.map.lock();
        assert_eq!(
            a_map.get("updateModel").unwrap().timeout_stamp_ms,
            b_map.get("updateModel").unwrap().timeout_stamp_ms
        );
    }

    #[tokio::test]
    async fn stop_writes_zero_and_sync_adopts_stopped() {
        let cache = InMemoryCacheClient::new();
        let timer = Timer::new(cache, "lenet", 3_600_000);
        timer.register("updateModel", 10);
        timer.start("i_1", "updateModel").await.unwrap();
        timer.stop("i_1", "updateModel").await.unwrap();
        let fired = timer.sync("i_1").await.unwrap();
        assert!(fired.is_empty());
        let map = timer.map.lock();
        assert_eq!(map.get("updateModel").unwrap().state, LocalState::Stopped);
    }

    #[tokio::test]
    async fn sync_fires_timeout_at_most_once() {
        let cache = InMemoryCacheClient::new();
        let timer = Timer::new(cache, "lenet", 3_600_000);
        timer.register("updateModel", 0); // already expired immediately
        timer.start("i_1", "updateModel").await.unwrap();
        let first = timer.sync("i_1").await.unwrap();
        assert_eq!(first, vec!["updateModel".to_string()]);
        let second = timer.sync("i_1").await.unwrap();
        assert!(second.is_empty());
    }
}
