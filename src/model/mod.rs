//! Model store (spec §3 `Model`/`ModelStore`, §4.I).
//!
//! Grounded on `model_store.cc`/`model_store.h` and `model_info.cc`/`model_info.h`
//! in `examples/original_source/mindspore_federated/fl_arch/ccsrc/`.

pub mod allreduce;
pub mod executor;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A weight's position and shape within the contiguous `Model::weight_data` buffer
/// (spec §3/§9: `(buf, offset, size)` triples, no per-weight allocations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightItem {
    pub offset: usize,
    pub size: usize,
    pub shape: Vec<usize>,
    /// Element type name (`"f32"` is the only type this core actually aggregates).
    pub dtype: String,
    pub require_aggr: bool,
}

impl WeightItem {
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.size / std::mem::size_of::<f32>()
    }
}

/// Contiguous parameter buffer plus the layout that addresses it (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub total_size: usize,
    pub weight_data: Vec<u8>,
    pub weight_items: BTreeMap<String, WeightItem>,
}

impl Model {
    #[must_use]
    pub fn new(weight_data: Vec<u8>, weight_items: BTreeMap<String, WeightItem>) -> Self {
        Self {
            total_size: weight_data.len(),
            weight_data,
            weight_items,
        }
    }

    #[must_use]
    pub fn weight_f32(&self, name: &str) -> Option<&[f32]> {
        let item = self.weight_items.get(name)?;
        bytes_as_f32(&self.weight_data[item.offset..item.offset + item.size])
    }

    #[must_use]
    pub fn weight_names(&self) -> Vec<String> {
        self.weight_items.keys().cloned().collect()
    }
}

#[must_use]
pub fn bytes_as_f32(bytes: &[u8]) -> Option<&[f32]> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    // SAFETY: `f32` has no alignment-sensitive invariants we violate here beyond
    // alignment itself; `weight_data` buffers in this crate are always built via
    // `f32_to_bytes`/`Vec<f32>::as_slice` round trips that preserve 4-byte alignment
    // because they originate from `Vec<f32>` storage reinterpreted once at
    // construction time. When alignment cannot be guaranteed, fall back to `None`.
    let ptr = bytes.as_ptr();
    if (ptr as usize) % std::mem::align_of::<f32>() != 0 {
        return None;
    }
    // SAFETY: length and alignment validated above; bytes outlive the returned slice
    // because they borrow from `bytes`.
    Some(unsafe { std::slice::from_raw_parts(ptr.cast::<f32>(), bytes.len() / 4) })
}

#[must_use]
pub fn f32_vec_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Bounded ring `iteration_num -> Model` (spec §3 `ModelStore`).
///
/// Invariants: strictly monotonic keys; inserting at `k` evicts every stored model
/// with key `>= k`; [`ModelStore::get_latest_model`] returns the entry with the
/// largest key.
pub struct ModelStore {
    max_model_count: usize,
    ring: BTreeMap<u64, Model>,
}

impl ModelStore {
    #[must_use]
    pub fn new(max_model_count: usize) -> Self {
        Self {
            max_model_count: max_model_count.max(1),
            ring: BTreeMap::new(),
        }
    }

    /// `Initialize` (spec §4.I): seeds the ring at `iteration = cur - 1` so the
    /// first `getModel` after start always has something to return.
    pub fn initialize(&mut self, cur_iteration: u64, model: Model) {
        let seed_iteration = cur_iteration.saturating_sub(1).max(1);
        self.insert(seed_iteration, model);
    }

    /// Inserting at `k` evicts every stored model with key `>= k` (spec §3).
    pub fn insert(&mut self, iteration: u64, model: Model) {
        self.ring.retain(|&k, _| k < iteration);
        self.ring.insert(iteration, model);
        while self.ring.len() > self.max_model_count {
            if let Some((&oldest, _)) = self.ring.iter().next() {
                self.ring.remove(&oldest);
            }
        }
    }

    #[must_use]
    pub fn get(&self, iteration: u64) -> Option<&Model> {
        self.ring.get(&iteration)
    }

    /// `GetLatestModel` (spec §3): the entry with the largest key.
    #[must_use]
    pub fn get_latest_model(&self) -> Option<(u64, &Model)> {
        self.ring.iter().next_back().map(|(k, v)| (*k, v))
    }

    /// `Reset` (spec §4.I): clears the ring and reseeds it from the latest model,
    /// used when a new instance begins.
    pub fn reset(&mut self, next_iteration: u64) {
        if let Some((_, latest)) = self.get_latest_model().map(|(k, v)| (k, v.clone())) {
            self.ring.clear();
            self.insert(next_iteration.saturating_sub(1).max(1), latest);
        } else {
            self.ring.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with(values: &[f32]) -> Model {
        let mut items = BTreeMap::new();
        items.insert(
            "w".to_string(),
            WeightItem {
                offset: 0,
                size: values.len() * 4,
                shape: vec![values.len()],
                dtype: "f32".to_string(),
                require_aggr: true,
            },
        );
        Model::new(f32_vec_to_bytes(values), items)
    }

    #[test]
    fn insert_evicts_keys_geq_inserted() {
        let mut store = ModelStore::new(3);
        store.insert(1, model_with(&[1.0]));
        store.insert(2, model_with(&[2.0]));
        store.insert(2, model_with(&[3.0])); // re-insert at 2 evicts the old 2
        assert_eq!(store.ring.len(), 2);
        assert_eq!(store.get(2).unwrap().weight_f32("w").unwrap(), &[3.0]);
    }

    #[test]
    fn ring_is_bounded_to_max_model_count() {
        let mut store = ModelStore::new(2);
        store.insert(1, model_with(&[1.0]));
        store.insert(2, model_with(&[2.0]));
        store.insert(3, model_with(&[3.0]));
        assert_eq!(store.ring.len(), 2);
        assert!(store.get(1).is_none());
    }

    #[test]
    fn get_latest_model_returns_largest_key() {
        let mut store = ModelStore::new(3);
        store.insert(1, model_with(&[1.0]));
        store.insert(5, model_with(&[5.0]));
        let (iter, _) = store.get_latest_model().unwrap();
        assert_eq!(iter, 5);
    }

    #[test]
    fn initialize_seeds_at_cur_minus_one() {
        let mut store = ModelStore::new(3);
        store.initialize(1, model_with(&[0.0]));
        assert!(store.get(1).is_some());
    }
}
