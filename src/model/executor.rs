//! Aggregation executor (spec §4.I) — accumulates client updates into a shared
//! buffer and runs the end-of-iteration weight aggregation.
//!
//! Grounded on `executor.cc`/`executor.h` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/`.

use super::allreduce::ring_all_reduce;
use super::{bytes_as_f32, f32_vec_to_bytes, Model, ModelStore};
use crate::error::{CoreError, CoreResult};
use crate::rpc::ServerLink;
use parking_lot::Mutex;
use std::collections::BTreeMap;

struct AggregationBuffer {
    data: Vec<f32>,
    require_aggr: BTreeMap<String, bool>,
    total_data_size: f64,
    done: bool,
}

/// Owns the model store and the single aggregation buffer (spec §5: "the
/// aggregation buffer — single-writer via the task thread after the last-event
/// callback, read-locked by `getModel`/`pullWeight` kernels"). `HandleModelUpdate`
/// and `HandlePullWeight` share `parameter_mutex_` (here, the same
/// [`parking_lot::Mutex`] guarding the buffer).
pub struct Executor {
    store: Mutex<ModelStore>,
    buffer: Mutex<Option<AggregationBuffer>>,
}

impl Executor {
    #[must_use]
    pub fn new(max_model_count: usize) -> Self {
        Self {
            store: Mutex::new(ModelStore::new(max_model_count)),
            buffer: Mutex::new(None),
        }
    }

    /// `Initialize(feature_map)` (spec §4.I).
    pub fn initialize(&self, cur_iteration: u64, model: Model) {
        self.store.lock().initialize(cur_iteration, model);
    }

    /// Overwrites (or adds) the model stored for `iteration`, used by the
    /// `pushWeight` kernel when a peer proactively delivers an aggregated model
    /// this server did not compute itself (spec §4.I `aggregation-skipper`).
    pub fn overwrite(&self, iteration: u64, model: Model) {
        self.store.lock().insert(iteration, model);
    }

    /// `Reset` (spec §4.I): new-instance reseed.
    pub fn reset(&self, next_iteration: u64) {
        self.store.lock().reset(next_iteration);
        *self.buffer.lock() = None;
    }

    #[must_use]
    pub fn get_model(&self, iteration: u64) -> Option<Model> {
        self.store.lock().get(iteration).cloned()
    }

    #[must_use]
    pub fn get_latest_model(&self) -> Option<(u64, Model)> {
        self.store.lock().get_latest_model().map(|(i, m)| (i, m.clone()))
    }

    /// `ResetAggregationStatus` (spec §4.I): zeroes the aggregation buffer and
    /// pre-fills `require_aggr = false` weights with the initial model's bytes so
    /// aggregation leaves them unchanged.
    pub fn reset_aggregation_status(&self, base_model: &Model) {
        let mut require_aggr = BTreeMap::new();
        let mut data = vec![0.0f32; base_model.total_size / std::mem::size_of::<f32>()];
        for (name, item) in &base_model.weight_items {
            require_aggr.insert(name.clone(), item.require_aggr);
            if !item.require_aggr {
                if let Some(bytes) = bytes_as_f32(&base_model.weight_data[item.offset..item.offset + item.size]) {
                    let start = item.offset / 4;
                    data[start..start + bytes.len()].copy_from_slice(bytes);
                }
            }
        }
        *self.buffer.lock() = Some(AggregationBuffer {
            data,
            require_aggr,
            total_data_size: 0.0,
            done: false,
        });
    }

    /// `HandleModelUpdate(feature_map, data_size)` (spec §4.I): adds the client's
    /// already-weighted contribution into the buffer for every `require_aggr=true`
    /// weight and accumulates `data_size`.
    pub fn handle_model_update(&self, base_model: &Model, update: &Model, data_size: f64) -> CoreResult<()> {
        let mut guard = self.buffer.lock();
        let Some(buf) = guard.as_mut() else {
            return Err(CoreError::SystemError("handle_model_update before reset_aggregation_status".into()));
        };
        for (name, item) in &base_model.weight_items {
            if !item.require_aggr {
                continue;
            }
            let Some(contribution) = update.weight_f32(name) else {
                continue;
            };
            let start = item.offset / 4;
            for (dst, src) in buf.data[start..start + contribution.len()].iter_mut().zip(contribution.iter()) {
                *dst += *src;
            }
        }
        buf.total_data_size += data_size;
        Ok(())
    }

    #[must_use]
    pub fn aggregation_data_size(&self) -> f64 {
        self.buffer.lock().as_ref().map_or(0.0, |b| b.total_data_size)
    }

    #[must_use]
    pub fn aggregation_done(&self) -> bool {
        self.buffer.lock().as_ref().is_some_and(|b| b.done)
    }

    /// `RunWeightAggregation` (spec §4.I). `ring` is already the intersection of
    /// live peers and contributors (step 1 of the algorithm is the caller's
    /// responsibility since it needs [`crate::registry::ServerRegistry`] and the
    /// per-server counter's contributor set). Returns `None` if aggregation was
    /// aborted ([`ring_all_reduce`] observed `should_abort`), `Some(model)` on
    /// success.
    pub async fn run_weight_aggregation<L: ServerLink>(
        &self,
        link: &L,
        base_model: &Model,
        ring: &[(String, String)],
        local_rank: usize,
        iteration: u64,
        should_abort: impl Fn() -> bool + Copy,
    ) -> CoreResult<Option<Model>> {
        let weight_names: Vec<String> = base_model
            .weight_items
            .iter()
            .filter(|(_, item)| item.require_aggr)
            .map(|(name, _)| name.clone())
            .collect();

        let mut data = {
            let guard = self.buffer.lock();
            guard
                .as_ref()
                .ok_or_else(|| CoreError::SystemError("run_weight_aggregation before reset_aggregation_status".into()))?
                .data
                .clone()
        };
        let mut total_data_size = self.aggregation_data_size();

        for name in &weight_names {
            let item = &base_model.weight_items[name];
            let start = item.offset / 4;
            let len = item.element_count();
            let ok = ring_all_reduce(link, ring, local_rank, iteration, name, &mut data[start..start + len], should_abort)
                .await?;
            if !ok {
                return Ok(None);
            }
        }

        let mut size_chunk = vec![total_data_size as f32];
        let ok = ring_all_reduce(link, ring, local_rank, iteration, "__data_size__", &mut size_chunk, should_abort).await?;
        if !ok {
            return Ok(None);
        }
        total_data_size = f64::from(size_chunk[0]);

        if total_data_size > 0.0 {
            for item in base_model.weight_items.values().filter(|item| item.require_aggr) {
                let start = item.offset / 4;
                let len = item.element_count();
                for v in &mut data[start..start + len] {
                    *v /= total_data_size as f32;
                }
            }
        }

        if let Some(buf) = self.buffer.lock().as_mut() {
            buf.done = true;
        }

        let new_model = Model::new(f32_vec_to_bytes(&data), base_model.weight_items.clone());
        self.store.lock().insert(iteration, new_model.clone());
        Ok(Some(new_model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{f32_vec_to_bytes, WeightItem};
    use crate::rpc::mock::InMemoryNetwork;

    fn base_model(values: &[f32], require_aggr: bool) -> Model {
        let mut items = BTreeMap::new();
        items.insert(
            "w".to_string(),
            WeightItem {
                offset: 0,
                size: values.len() * 4,
                shape: vec![values.len()],
                dtype: "f32".to_string(),
                require_aggr,
            },
        );
        Model::new(f32_vec_to_bytes(values), items)
    }

    #[test]
    fn reset_aggregation_status_preserves_non_aggregated_weights() {
        let executor = Executor::new(3);
        let model = base_model(&[9.0, 9.0], false);
        executor.reset_aggregation_status(&model);
        let buf = executor.buffer.lock();
        assert_eq!(buf.as_ref().unwrap().data, vec![9.0, 9.0]);
    }

    #[test]
    fn handle_model_update_accumulates_contributions_and_data_size() {
        let executor = Executor::new(3);
        let model = base_model(&[0.0, 0.0], true);
        executor.reset_aggregation_status(&model);
        let update1 = base_model(&[2.0, 4.0], true);
        let update2 = base_model(&[1.0, 1.0], true);
        executor.handle_model_update(&model, &update1, 10.0).unwrap();
        executor.handle_model_update(&model, &update2, 20.0).unwrap();
        assert_eq!(executor.aggregation_data_size(), 30.0);
        let buf = executor.buffer.lock();
        assert_eq!(buf.as_ref().unwrap().data, vec![3.0, 5.0]);
    }

    #[tokio::test]
    async fn single_node_ring_divides_by_total_data_size() {
        let net = InMemoryNetwork::new();
        let link = net.link_for("a");
        let executor = Executor::new(3);
        let model = base_model(&[0.0, 0.0], true);
        executor.reset_aggregation_status(&model);
        let update = base_model(&[10.0, 20.0], true);
        executor.handle_model_update(&model, &update, 5.0).unwrap();

        let ring = vec![("a".to_string(), "addr-a".to_string())];
        let result = executor
            .run_weight_aggregation(&link, &model, &ring, 0, 1, || false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.weight_f32("w").unwrap(), &[2.0, 4.0]);
        assert!(executor.aggregation_done());
    }
}
