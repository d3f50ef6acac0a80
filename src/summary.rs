//! Per-iteration summary aggregation (spec §3 "Summary", §6 summary metrics file).
//!
//! Grounded on `iteration_metrics.cc`/`iteration_metrics.h` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/`.

use crate::cache::{CacheClient, CacheKeys};
use crate::error::CoreResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `SETEX NX` TTL for the acquire-once summary-writer lock (spec §3).
const SUMMARY_LOCK_TTL_SECS: u64 = 10;
/// TTL once the elected writer has persisted metrics and written `"Finish"`.
const SUMMARY_FINISH_TTL_SECS: u64 = 30;

/// Per-round accept/reject/total counters plus the process-local accumulators
/// the summary persists (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundCounts {
    pub accepted: u64,
    pub rejected: u64,
}

/// One server's contribution to the iteration summary, persisted as one field
/// of `summary:Hash` keyed by `node_id` (spec §3/§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryAccumulator {
    pub round_counts: HashMap<String, RoundCounts>,
    pub upload_loss_sum: f64,
    pub upload_loss_count: u64,
    pub upload_accuracy_sum: f64,
    pub upload_accuracy_count: u64,
    /// Three buckets: `<L1`, `<L2`, `>=L2` (spec §3).
    pub participation_time_buckets: [u64; 3],
    pub sign_ds_aggregate: f64,
}

impl SummaryAccumulator {
    pub fn record_accept(&mut self, round: &str) {
        self.round_counts.entry(round.to_string()).or_default().accepted += 1;
    }

    pub fn record_reject(&mut self, round: &str) {
        self.round_counts.entry(round.to_string()).or_default().rejected += 1;
    }

    pub fn record_upload_loss(&mut self, loss: f64) {
        self.upload_loss_sum += loss;
        self.upload_loss_count += 1;
    }

    pub fn record_upload_accuracy(&mut self, accuracy: f64) {
        self.upload_accuracy_sum += accuracy;
        self.upload_accuracy_count += 1;
    }

    /// Buckets `participation_time_ms` into `<l1_ms`, `<l2_ms`, or `>=l2_ms`
    /// (spec §4.H: "participation time = update_model_time_ms - startFLJob_time_ms").
    pub fn record_participation_time(&mut self, participation_time_ms: u64, l1_ms: u64, l2_ms: u64) {
        let bucket = if participation_time_ms < l1_ms {
            0
        } else if participation_time_ms < l2_ms {
            1
        } else {
            2
        };
        self.participation_time_buckets[bucket] += 1;
    }

    pub fn record_sign_ds(&mut self, value: f64) {
        self.sign_ds_aggregate += value;
    }

    #[must_use]
    pub fn mean_upload_loss(&self) -> Option<f64> {
        (self.upload_loss_count > 0).then(|| self.upload_loss_sum / self.upload_loss_count as f64)
    }

    #[must_use]
    pub fn mean_upload_accuracy(&self) -> Option<f64> {
        (self.upload_accuracy_count > 0).then(|| self.upload_accuracy_sum / self.upload_accuracy_count as f64)
    }
}

/// Owns this process's per-iteration accumulator and the acquire-once lock
/// protocol used to elect a single writer per instance (spec §3).
pub struct Summary {
    node_id: String,
    accumulator: Mutex<SummaryAccumulator>,
}

impl Summary {
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            accumulator: Mutex::new(SummaryAccumulator::default()),
        }
    }

    pub fn with_accumulator<R>(&self, f: impl FnOnce(&mut SummaryAccumulator) -> R) -> R {
        f(&mut self.accumulator.lock())
    }

    pub fn reset(&self) {
        *self.accumulator.lock() = SummaryAccumulator::default();
    }

    /// Publishes this server's accumulator into `summary:Hash[node_id]`
    /// (spec §3). Every server publishes, regardless of who wins the lock.
    pub async fn publish<C: CacheClient>(&self, cache: &C, keys: &CacheKeys) -> CoreResult<()> {
        let json = {
            let acc = self.accumulator.lock();
            serde_json::to_string(&*acc)?
        };
        cache.hset(&keys.summary_hash(), &self.node_id, &json).await
    }

    /// Races to become the elected writer that persists `metrics.json`
    /// (spec §3: `SETEX NX`, 10s).
    pub async fn try_acquire_writer_lock<C: CacheClient>(&self, cache: &C, keys: &CacheKeys) -> CoreResult<bool> {
        cache.set_ex_nx(&keys.summary_lock(), &self.node_id, SUMMARY_LOCK_TTL_SECS).await
    }

    /// Called by the elected writer once it has persisted `metrics.json`.
    pub async fn mark_finished<C: CacheClient>(&self, cache: &C, keys: &CacheKeys) -> CoreResult<()> {
        cache.set_ex(&keys.summary_lock(), "Finish", SUMMARY_FINISH_TTL_SECS).await
    }

    /// Reads every server's published accumulator for this iteration, merging
    /// them into one (spec: the elected writer aggregates across `summary:Hash`).
    pub async fn read_all<C: CacheClient>(cache: &C, keys: &CacheKeys) -> CoreResult<SummaryAccumulator> {
        let raw = cache.hgetall(&keys.summary_hash()).await?;
        let mut merged = SummaryAccumulator::default();
        for json in raw.values() {
            let Ok(part) = serde_json::from_str::<SummaryAccumulator>(json) else {
                continue;
            };
            for (round, counts) in part.round_counts {
                let entry = merged.round_counts.entry(round).or_default();
                entry.accepted += counts.accepted;
                entry.rejected += counts.rejected;
            }
            merged.upload_loss_sum += part.upload_loss_sum;
            merged.upload_loss_count += part.upload_loss_count;
            merged.upload_accuracy_sum += part.upload_accuracy_sum;
            merged.upload_accuracy_count += part.upload_accuracy_count;
            for i in 0..3 {
                merged.participation_time_buckets[i] += part.participation_time_buckets[i];
            }
            merged.sign_ds_aggregate += part.sign_ds_aggregate;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;

    #[test]
    fn participation_time_buckets_into_three_ranges() {
        let mut acc = SummaryAccumulator::default();
        acc.record_participation_time(10, 100, 500);
        acc.record_participation_time(200, 100, 500);
        acc.record_participation_time(600, 100, 500);
        assert_eq!(acc.participation_time_buckets, [1, 1, 1]);
    }

    #[tokio::test]
    async fn only_one_server_wins_the_writer_lock() {
        let cache = InMemoryCacheClient::new();
        let keys = CacheKeys::new("lenet", "i_1");
        let a = Summary::new("node-a");
        let b = Summary::new("node-b");
        assert!(a.try_acquire_writer_lock(&cache, &keys).await.unwrap());
        assert!(!b.try_acquire_writer_lock(&cache, &keys).await.unwrap());
    }

    #[tokio::test]
    async fn read_all_merges_every_servers_published_accumulator() {
        let cache = InMemoryCacheClient::new();
        let keys = CacheKeys::new("lenet", "i_1");
        let a = Summary::new("node-a");
        let b = Summary::new("node-b");
        a.with_accumulator(|acc| acc.record_accept("startFLJob"));
        b.with_accumulator(|acc| acc.record_accept("startFLJob"));
        a.publish(&cache, &keys).await.unwrap();
        b.publish(&cache, &keys).await.unwrap();

        let merged = Summary::read_all(&cache, &keys).await.unwrap();
        assert_eq!(merged.round_counts["startFLJob"].accepted, 2);
    }
}
