//! Distributed counter service (spec §4.D) — named thresholded counters with
//! first/last-event callbacks, including the per-server-sharded variant used to
//! gate aggregation.
//!
//! Grounded on `counter.cc`/`counter.h` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/common/distributed_cache/`.

use crate::cache::{CacheClient, CacheKeys};
use crate::error::CoreResult;
use crate::registry::ServerRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;

/// A pending counter event the task thread (spec §4.F) must drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEvent {
    First,
    Last,
}

#[derive(Debug, Clone)]
struct CounterInfo {
    threshold: u64,
    per_server: bool,
    first_triggered: bool,
    last_triggered: bool,
    has_server_exit: bool,
}

/// Named thresholded counters backed by atomic `HINCRBY`.
pub struct Counter<C: CacheClient> {
    cache: C,
    fl_name: String,
    map: Mutex<HashMap<String, CounterInfo>>,
    ttl_secs: std::sync::atomic::AtomicU64,
}

impl<C: CacheClient> Counter<C> {
    #[must_use]
    pub fn new(cache: C, fl_name: impl Into<String>, global_iteration_time_window_ms: u64) -> Self {
        Self {
            cache,
            fl_name: fl_name.into(),
            map: Mutex::new(HashMap::new()),
            ttl_secs: std::sync::atomic::AtomicU64::new(iteration_ttl_secs(global_iteration_time_window_ms)),
        }
    }

    /// `SyncPeriod` (SPEC_FULL §B): re-derives the count-hash TTL whenever
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

    /// `RegisterCounter`/`RegisterPerServerCounter` (spec §4.D). Idempotent;
    /// re-registration for the same name is a no-op (the original logs a warning).
    pub fn register(&self, name: impl Into<String>, threshold: u64, per_server: bool) {
        let name = name.into();
        let mut map = self.map.lock();
        if map.contains_key(&name) {
            tracing::warn!(counter = %name, "counter already registered");
            return;
        }
        map.insert(
            name,
            CounterInfo {
                threshold,
                per_server,
                first_triggered: false,
                last_triggered: false,
                has_server_exit: false,
            },
        );
    }

    /// `ReinitCounter` (SPEC_FULL §B): adjusts a registered counter's threshold.
    pub fn reinit(&self, name: &str, threshold: u64) {
        if let Some(info) = self.map.lock().get_mut(name) {
            info.threshold = threshold;
        }
    }

    /// Clears per-iteration trigger flags; called from `HandleInstanceEvent`.
    pub fn reset_on_new_iteration(&self) {
        for info in self.map.lock().values_mut() {
            info.first_triggered = false;
            info.last_triggered = false;
            info.has_server_exit = false;
        }
    }

    /// `Count` (spec §4.D): the only write path. Returns the events newly crossed
    /// by this call (empty, `[First]`, `[Last]`, or `[First, Last]` when
    /// `threshold == 1`).
    pub async fn count(&self, instance_name: &str, name: &str) -> CoreResult<Vec<CounterEvent>> {
        let keys = self.keys(instance_name);
        let threshold = {
            let map = self.map.lock();
            let Some(info) = map.get(name) else {
                tracing::warn!(counter = %name, "count() on unregistered counter");
                return Ok(Vec::new());
            };
            if info.per_server {
                tracing::warn!(counter = %name, "count() called on a per-server counter; use count_per_server instead");
            }
            info.threshold
        };

        let value = self.cache.hincr(&keys.count_hash(), name, 1).await? as u64;

        if value == 1 {
            self.cache.expire(&keys.count_hash(), self.ttl_secs()).await?;
        }

        let mut events = Vec::new();
        let mut map = self.map.lock();
        let info = map.get_mut(name).expect("checked above");
        if value >= 1 && !info.first_triggered {
            info.first_triggered = true;
            events.push(CounterEvent::First);
        }
        if value >= threshold && !info.last_triggered {
            info.last_triggered = true;
            events.push(CounterEvent::Last);
        }
        Ok(events)
    }

    /// Per-server variant of `count` that also accounts for dead-server exclusion
    /// (spec §4.D): contributions from servers no longer in `registry` flip
    /// `has_server_exit`, which gates the `updateModel` last-event as a failure.
    pub async fn count_per_server(
        &self,
        instance_name: &str,
        name: &str,
        registry: &ServerRegistry<C>,
    ) -> CoreResult<(Vec<CounterEvent>, bool)> {
        let keys = self.keys(instance_name);
        let threshold = {
            let map = self.map.lock();
            map.get(name).map(|i| i.threshold).unwrap_or(u64::MAX)
        };
        let server_hash = keys.count_per_server_hash(name);
        self.cache.hincr(&server_hash, registry.node_id(), 1).await?;

        let contributions = self.cache.hgetall(&server_hash).await?;
        let mut total: u64 = 0;
        let mut has_exit = false;
        for (node_id, v) in &contributions {
            let v: u64 = v.parse().unwrap_or(0);
            if registry.is_live(node_id) {
                total += v;
            } else {
                has_exit = true;
            }
        }

        let mut events = Vec::new();
        let mut map = self.map.lock();
        let info = map.get_mut(name).expect("checked above");
        info.has_server_exit = has_exit;
        if total >= 1 && !info.first_triggered {
            info.first_triggered = true;
            events.push(CounterEvent::First);
        }
        if total >= threshold && !info.last_triggered {
            info.last_triggered = true;
            events.push(CounterEvent::Last);
        }
        Ok((events, has_exit))
    }

    /// `ReachThreshold` (spec §4.D).
    pub async fn reach_threshold(&self, instance_name: &str, name: &str) -> CoreResult<bool> {
        let (threshold, per_server, last_triggered) = {
            let map = self.map.lock();
            let Some(info) = map.get(name) else {
                return Ok(true);
            };
            (info.threshold, info.per_server, info.last_triggered)
        };
        if last_triggered {
            return Ok(true);
        }
        let keys = self.keys(instance_name);
        let value = if per_server {
            self.cache
                .hgetall(&keys.count_per_server_hash(name))
                .await?
                .values()
                .filter_map(|v| v.parse::<u64>().ok())
                .sum::<u64>()
        } else {
            self.cache
                .hget(&keys.count_hash(), name)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        Ok(value >= threshold)
    }

    #[must_use]
    pub fn has_server_exit(&self, name: &str) -> bool {
        self.map.lock().get(name).is_some_and(|i| i.has_server_exit)
    }

    /// Node ids that have contributed at least once to a per-server counter
    /// this iteration (spec §4.I step 1's `ring = live peers ∩ contributors`).
    pub async fn contributors(&self, instance_name: &str, name: &str) -> CoreResult<Vec<String>> {
        let keys = self.keys(instance_name);
        let hash = self.cache.hgetall(&keys.count_per_server_hash(name)).await?;
        Ok(hash
            .into_iter()
            .filter(|(_, v)| v.parse::<i64>().unwrap_or(0) > 0)
            .map(|(node_id, _)| node_id)
            .collect())
    }
}

/// `global_iteration_time_window` (ms) plus a 30 minute grace period (spec §6),
/// so a cache entry outlives the iteration even under clock skew between servers.
fn iteration_ttl_secs(global_iteration_time_window_ms: u64) -> u64 {
    global_iteration_time_window_ms / 1000 + 30 * 60
}
