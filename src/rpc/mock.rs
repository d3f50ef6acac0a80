//! In-process [`ServerLink`] used by scenario tests so multi-server behaviour is
//! deterministic without a live network (spec §8: "deterministic given mock
//! transports").
//!
//! Grounded on the same shared-`Arc<Mutex<..>>` hub pattern as
//! [`crate::cache::mock::InMemoryCacheClient`].

use super::{CollectiveMessageMeta, ServerLink};
use crate::error::{CoreError, CoreResult};
use crate::model::Model;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::BroadcastEvent;

#[derive(Default)]
struct Hub {
    /// node_id -> whether it is currently reachable (tests flip this to
    /// simulate a crashed/partitioned peer).
    reachable: DashMap<String, bool>,
    /// (node_id, iteration) -> model this node has broadcast or holds locally.
    models: Mutex<HashMap<(String, u64), Model>>,
    /// Pending received events per node, drained by a real service loop; tests
    /// mostly inspect this directly.
    events: DashMap<String, Vec<BroadcastEvent>>,
    chunks: Mutex<HashMap<CollectiveMessageMeta, Vec<f32>>>,
    chunk_arrived: Notify,
}

/// Shared in-memory network. Clone to get a per-node handle; all handles created
/// from the same `InMemoryNetwork::link_for` share one [`Hub`].
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    hub: Arc<Hub>,
}

impl InMemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn link_for(&self, node_id: impl Into<String>) -> InMemoryServerLink {
        let node_id = node_id.into();
        self.hub.reachable.insert(node_id.clone(), true);
        InMemoryServerLink {
            hub: self.hub.clone(),
            node_id,
        }
    }

    /// Simulates a peer crash/partition: subsequent `ping`/RPCs to it fail.
    pub fn partition(&self, node_id: &str) {
        self.hub.reachable.insert(node_id.to_string(), false);
    }

    pub fn heal(&self, node_id: &str) {
        self.hub.reachable.insert(node_id.to_string(), true);
    }
}

#[derive(Clone)]
pub struct InMemoryServerLink {
    hub: Arc<Hub>,
    node_id: String,
}

impl InMemoryServerLink {
    fn check_reachable(&self, target: &str) -> CoreResult<()> {
        if self.hub.reachable.get(target).map(|r| *r).unwrap_or(false) {
            Ok(())
        } else {
            Err(CoreError::RpcTimeout(format!("{target} unreachable")))
        }
    }
}

impl ServerLink for InMemoryServerLink {
    async fn ping(&self, node_id: &str, _addr: &str) -> CoreResult<bool> {
        Ok(self.check_reachable(node_id).is_ok())
    }

    async fn broadcast_event(&self, node_id: &str, _addr: &str, event: BroadcastEvent) -> CoreResult<()> {
        self.check_reachable(node_id)?;
        self.hub.events.entry(node_id.to_string()).or_default().push(event);
        Ok(())
    }

    async fn get_model_weight(&self, node_id: &str, _addr: &str, iteration: u64) -> CoreResult<Option<Model>> {
        self.check_reachable(node_id)?;
        Ok(self.hub.models.lock().get(&(node_id.to_string(), iteration)).cloned())
    }

    async fn broadcast_model_weight(&self, node_id: &str, _addr: &str, iteration: u64, model: &Model) -> CoreResult<()> {
        self.check_reachable(node_id)?;
        self.hub
            .models
            .lock()
            .insert((node_id.to_string(), iteration), model.clone());
        Ok(())
    }

    async fn send_chunk(&self, node_id: &str, _addr: &str, meta: CollectiveMessageMeta, data: Vec<f32>) -> CoreResult<()> {
        self.check_reachable(node_id)?;
        self.hub.chunks.lock().insert(meta, data);
        self.hub.chunk_arrived.notify_waiters();
        Ok(())
    }

    async fn recv_chunk(&self, meta: &CollectiveMessageMeta) -> CoreResult<Vec<f32>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(super::RPC_TIMEOUT_SECS);
        loop {
            if let Some(data) = self.hub.chunks.lock().remove(meta) {
                return Ok(data);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::RpcTimeout(format!(
                    "no chunk matching {meta:?} within {}s",
                    super::RPC_TIMEOUT_SECS
                )));
            }
            let _ = tokio::time::timeout(remaining, self.hub.chunk_arrived.notified()).await;
        }
    }
}

#[allow(dead_code)]
impl InMemoryServerLink {
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn events_for(&self, node_id: &str) -> Vec<BroadcastEvent> {
        self.hub.events.get(node_id).map(|v| v.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{f32_vec_to_bytes, Model, WeightItem};
    use std::collections::BTreeMap;

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

    #[tokio::test]
    async fn send_then_recv_chunk_round_trips() {
        let net = InMemoryNetwork::new();
        let a = net.link_for("a");
        let b = net.link_for("b");
        let meta = CollectiveMessageMeta {
            iteration: 1,
            weight_name: "w".into(),
            phase: super::super::CollectivePhase::ReduceScatter,
            chunk_index: 0,
            for_index: 0,
            send_node: "a".into(),
            recv_node: "b".into(),
        };
        a.send_chunk("b", "addr-b", meta.clone(), vec![1.0, 2.0]).await.unwrap();
        let got = b.recv_chunk(&meta).await.unwrap();
        assert_eq!(got, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn partitioned_peer_fails_ping_and_rpc() {
        let net = InMemoryNetwork::new();
        let a = net.link_for("a");
        net.link_for("b");
        net.partition("b");
        assert!(!a.ping("b", "addr-b").await.unwrap());
        assert!(a.get_model_weight("b", "addr-b", 1).await.is_err());
    }

    #[tokio::test]
    async fn broadcast_and_get_model_weight_round_trip() {
        let net = InMemoryNetwork::new();
        let a = net.link_for("a");
        let b = net.link_for("b");
        let model = model_with(&[1.0, 2.0, 3.0]);
        a.broadcast_model_weight("b", "addr-b", 7, &model).await.unwrap();
        let got = b.get_model_weight("b", "addr-b", 7).await.unwrap().unwrap();
        assert_eq!(got.weight_f32("w").unwrap(), &[1.0, 2.0, 3.0]);
    }
}
